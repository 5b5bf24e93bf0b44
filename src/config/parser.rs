//! Declaration parser for loading stack documents.
//!
//! This module handles loading declarations from YAML files and environment
//! variables, with proper precedence and error handling.

use crate::error::{DeclarationError, Result, StackError};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::spec::StackDocument;

/// Prefix of feature flag overrides (`HALLDYLL_FLAG_ENABLE_WAF=true`).
pub const FLAG_ENV_PREFIX: &str = "HALLDYLL_FLAG_";

/// Parser for stack declaration documents.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new declaration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a document from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<StackDocument> {
        let path = path.as_ref();
        info!("Loading declarations from: {}", path.display());

        if !path.exists() {
            return Err(StackError::Declaration(DeclarationError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            StackError::Declaration(DeclarationError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses a document from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<StackDocument> {
        debug!("Parsing YAML declarations");

        let doc: StackDocument = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            StackError::Declaration(DeclarationError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Parsed stack {} with {} resources",
            doc.stack.name,
            doc.resources.len()
        );
        Ok(doc)
    }

    /// Loads a document and applies process environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an override
    /// has an invalid value.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<StackDocument> {
        let mut doc = self.load_file(path)?;
        Self::apply_env_overrides(&mut doc)?;
        Ok(doc)
    }

    /// Applies overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if an override has an invalid value.
    pub fn apply_env_overrides(doc: &mut StackDocument) -> Result<()> {
        let flag_vars: Vec<(String, String)> = std::env::vars()
            .filter(|(k, _)| k.starts_with(FLAG_ENV_PREFIX))
            .collect();
        Self::apply_overrides_from(doc, |key| std::env::var(key).ok(), &flag_vars)
    }

    /// Applies overrides read through `lookup`.
    ///
    /// `flag_vars` holds `HALLDYLL_FLAG_<NAME>` pairs; the flag name is the
    /// lowercased suffix.
    ///
    /// # Errors
    ///
    /// Returns an error if an override has an invalid value.
    pub fn apply_overrides_from<F>(
        doc: &mut StackDocument,
        lookup: F,
        flag_vars: &[(String, String)],
    ) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("HALLDYLL_STACK_NAME") {
            debug!("Overriding stack.name from environment");
            doc.stack.name = name;
        }

        if let Some(env) = lookup("HALLDYLL_STACK_ENVIRONMENT") {
            debug!("Overriding stack.environment from environment");
            doc.stack.environment = env;
        }

        if let Some(region) = lookup("HALLDYLL_STACK_REGION") {
            debug!("Overriding stack.region from environment");
            doc.stack.region = Some(region);
        }

        if let Some(bucket) = lookup("HALLDYLL_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            doc.state.bucket = Some(bucket);
        }

        if let Some(prefix) = lookup("HALLDYLL_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            doc.state.prefix = Some(prefix);
        }

        if let Some(raw) = lookup("HALLDYLL_MAX_PARALLEL") {
            let value = raw.trim().parse::<usize>().map_err(|_| {
                StackError::Declaration(DeclarationError::validation(
                    format!("HALLDYLL_MAX_PARALLEL must be a positive integer, got '{raw}'"),
                    "executor.max_parallel",
                ))
            })?;
            debug!("Overriding executor.max_parallel from environment");
            doc.executor.max_parallel = value;
        }

        for (key, raw) in flag_vars {
            let Some(suffix) = key.strip_prefix(FLAG_ENV_PREFIX) else {
                continue;
            };
            let name = suffix.to_lowercase();
            match parse_bool(raw) {
                Some(value) => {
                    debug!("Overriding flag {name} from environment");
                    doc.flags.insert(name, value);
                }
                None => warn!("Ignoring {key}: '{raw}' is not a boolean"),
            }
        }

        Ok(())
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                StackError::Declaration(DeclarationError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Default declaration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &[
    "halldyll.stack.yaml",
    "halldyll.stack.yml",
    "stack.yaml",
    "stack.yml",
];

/// Finds the declaration file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no declaration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found declaration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(StackError::Declaration(DeclarationError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceKind;
    use std::collections::HashMap;

    #[test]
    fn test_parse_minimal_document() {
        let yaml = r"
stack:
  name: test-stack
resources: []
";
        let parser = ConfigParser::new();
        let doc = parser.parse_yaml(yaml, None).unwrap();
        assert_eq!(doc.stack.name, "test-stack");
        assert_eq!(doc.stack.environment, "dev");
    }

    #[test]
    fn test_parse_full_document() {
        let yaml = r#"
stack:
  name: wordpress
  environment: production
  region: ap-northeast-1
  tags:
    Project: wordpress

flags:
  enable_waf: false

state:
  backend: s3
  bucket: halldyll-state
  prefix: stacks/

resources:
  - id: vpc
    kind: vpc
    properties:
      cidr: 10.0.0.0/16
  - id: alb
    kind: load_balancer
    properties:
      subnets: ["${public-a}", "${public-b}"]
    depends_on: [vpc]
  - id: waf
    kind: web_acl
    enabled_if: enable_waf

wiring:
  - resource: alb
    depends_on: [waf]
"#;
        let parser = ConfigParser::new();
        let doc = parser.parse_yaml(yaml, None).unwrap();
        assert_eq!(doc.resources.len(), 3);
        assert_eq!(doc.resources[1].kind, ResourceKind::LoadBalancer);
        assert_eq!(doc.resources[1].depends_on, vec![String::from("vpc")]);
        assert_eq!(doc.resources[2].enabled_if.as_deref(), Some("enable_waf"));
        assert_eq!(doc.wiring.len(), 1);
        assert_eq!(doc.state.bucket.as_deref(), Some("halldyll-state"));
    }

    #[test]
    fn test_unknown_kind_is_parse_error() {
        let yaml = r"
stack:
  name: web
resources:
  - id: x
    kind: mainframe
";
        let err = ConfigParser::new().parse_yaml(yaml, None).unwrap_err();
        assert!(matches!(
            err,
            StackError::Declaration(DeclarationError::ParseError { .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let yaml = "stack:\n  name: web\n";
        let mut doc = ConfigParser::new().parse_yaml(yaml, None).unwrap();

        let vars: HashMap<&str, &str> = HashMap::from([
            ("HALLDYLL_STACK_ENVIRONMENT", "staging"),
            ("HALLDYLL_STATE_BUCKET", "override-bucket"),
            ("HALLDYLL_MAX_PARALLEL", "8"),
        ]);
        let flags = vec![
            (String::from("HALLDYLL_FLAG_ENABLE_WAF"), String::from("yes")),
            (String::from("HALLDYLL_FLAG_BROKEN"), String::from("maybe")),
        ];

        ConfigParser::apply_overrides_from(
            &mut doc,
            |k| vars.get(k).map(ToString::to_string),
            &flags,
        )
        .unwrap();

        assert_eq!(doc.stack.environment, "staging");
        assert_eq!(doc.state.bucket.as_deref(), Some("override-bucket"));
        assert_eq!(doc.executor.max_parallel, 8);
        assert_eq!(doc.flags.get("enable_waf"), Some(&true));
        assert!(!doc.flags.contains_key("broken"));
    }

    #[test]
    fn test_invalid_parallelism_override() {
        let mut doc = ConfigParser::new()
            .parse_yaml("stack:\n  name: web\n", None)
            .unwrap();
        let result = ConfigParser::apply_overrides_from(
            &mut doc,
            |k| (k == "HALLDYLL_MAX_PARALLEL").then(|| String::from("many")),
            &[],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_init_template_is_valid() {
        use crate::config::ConfigValidator;
        use crate::graph::DependencyGraph;
        use crate::model::Stack;

        let yaml = include_str!("../../templates/halldyll.stack.yaml");
        let doc = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        ConfigValidator::new().validate(&doc).unwrap();

        let stack = Stack::build(&doc.settings(), &doc.resources).unwrap();
        let graph = DependencyGraph::build_with_patches(&stack, &doc.wiring).unwrap();
        assert!(graph.contains("cdn"));
        assert!(!graph.contains("waf"));
        assert!(graph.dependencies("wordpress").unwrap().contains("http"));
    }

    #[test]
    fn test_find_config_file_searches_upward() {
        let dir = tempfile::TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("stack.yaml"), "stack:\n  name: web\n").unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, dir.path().join("stack.yaml"));
    }
}
