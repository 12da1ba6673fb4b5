// SPDX-License-Identifier: Apache-2.0

use clap::{Args, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Args, Clone, Default)]
pub struct StartArgs {
    /// Configuration file, defaults to $XDG_CONFIG_HOME/logsnarf/logsnarf.toml
    #[arg(long, short = 'f', env = "LOGSNARF_CONFIG")]
    pub config: Option<PathBuf>,

    /// Pipelines to run (comma separated), defaults to every pipeline in the config file
    #[arg(long, env = "LOGSNARF_PIPELINES", value_delimiter = ',')]
    pub pipelines: Vec<String>,
}

impl StartArgs {
    /// Requested pipeline names with blanks and duplicates removed.
    pub fn pipeline_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for name in self.pipelines.iter().map(|n| n.trim()) {
            if !name.is_empty() && !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
        names
    }
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_names() {
        let args = StartArgs {
            pipelines: vec!["syslog".into(), " apache".into(), "".into(), "syslog".into()],
            ..Default::default()
        };
        assert_eq!(args.pipeline_names(), vec!["syslog", "apache"]);
    }
}
