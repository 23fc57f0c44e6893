//! Document Template - the markup wrapped around every formula

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Package {
    pub name: String,
    #[serde(default)]
    pub options: Vec<String>,
}

impl Package {
    fn new(name: &str, options: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            options: options.iter().map(|o| o.to_string()).collect(),
        }
    }

    fn render(&self) -> String {
        if self.options.is_empty() {
            format!("\\usepackage{{{}}}", self.name)
        } else {
            format!("\\usepackage[{}]{{{}}}", self.options.join(","), self.name)
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MathEnvironment {
    /// `\[ ... \]`
    #[default]
    Display,
    /// `gather*`, one centered formula per line.
    Gather,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentTemplate {
    #[serde(default = "default_class")]
    pub document_class: String,
    #[serde(default)]
    pub packages: Vec<Package>,
    #[serde(default)]
    pub environment: MathEnvironment,
}

fn default_class() -> String { "minimal".to_string() }

impl Default for DocumentTemplate {
    fn default() -> Self {
        Self {
            document_class: default_class(),
            packages: vec![
                Package::new("inputenc", &["utf8"]),
                Package::new("amsmath,amsfonts,amssymb", &[]),
                Package::new("mathrsfs,esdiff,cancel", &[]),
                Package::new("color", &["dvips", "usenames"]),
                Package::new("nicefrac", &[]),
                Package::new("siunitx", &["fraction=nice"]),
                Package::new("mathpazo", &[]),
            ],
            environment: MathEnvironment::Display,
        }
    }
}

impl DocumentTemplate {
    /// Full markup source for a validated formula.
    pub fn render(&self, formula: &str) -> String {
        let mut out = format!("\\documentclass{{{}}}\n", self.document_class);
        for package in &self.packages {
            out.push_str(&package.render());
            out.push('\n');
        }
        out.push_str("\\begin{document}\n");
        let (open, close) = match self.environment {
            MathEnvironment::Display => ("\\[", "\\]"),
            MathEnvironment::Gather => ("\\begin{gather*}", "\\end{gather*}"),
        };
        out.push_str(open);
        out.push('\n');
        out.push_str(formula);
        out.push('\n');
        out.push_str(close);
        out.push_str("\n\\end{document}\n");
        out
    }
}
