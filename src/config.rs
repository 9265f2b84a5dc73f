//! Explicit configuration: runtime settings, the TOML service-definition
//! model, and the registries that turn declarations into executors.
//!
//! Nothing in the crate reads global state; everything that needs the work
//! root or the queue address receives a [`Settings`] at construction.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use directories::BaseDirs;
use serde::Deserialize;
use tracing::debug;

use crate::errors::ConfigError;
use crate::executor::{Backend, CommandOption, Executor, FileResult};
use crate::limits::{DefaultLimits, JobLimits};

/// Runtime settings handed to executors and the task queue.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root under which per-job working directories are minted.
    pub work_dir: PathBuf,
    /// Address of the local queue server.
    pub queue_addr: SocketAddr,
}

/// Resolve the work root following the priority chain:
///   1. explicit flag
///   2. `SERVEX_WORK_DIR` environment variable
///   3. `$XDG_DATA_HOME/servex/work`
///   4. `~/.local/share/servex/work`
pub fn resolve_work_dir(flag: Option<&str>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("SERVEX_WORK_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        if !xdg.is_empty() {
            return PathBuf::from(xdg).join("servex").join("work");
        }
    }
    if let Some(base_dirs) = BaseDirs::new() {
        return base_dirs
            .home_dir()
            .join(".local")
            .join("share")
            .join("servex")
            .join("work");
    }
    PathBuf::from("servex-work")
}

/// Top-level service definition file.
#[derive(Debug, Deserialize)]
pub struct ServicesFile {
    #[serde(default)]
    pub services: HashMap<String, ServiceDef>,
}

/// Declaration of one service: its option schema, declared outputs, named
/// execution configurations, and the limits policy choosing among them.
#[derive(Debug, Deserialize)]
pub struct ServiceDef {
    #[serde(default)]
    pub options: Vec<OptionDef>,
    #[serde(default)]
    pub result: Vec<FileResultDef>,
    #[serde(default)]
    pub configurations: HashMap<String, ConfigurationDef>,
    pub limits: String,
}

#[derive(Debug, Deserialize)]
pub struct OptionDef {
    #[serde(rename = "ref")]
    pub name: String,
    pub param: String,
    #[serde(rename = "val")]
    pub default: Option<String>,
}

/// Either `path` or `pattern`, exactly one.
#[derive(Debug, Deserialize)]
pub struct FileResultDef {
    pub path: Option<String>,
    pub pattern: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConfigurationDef {
    #[serde(rename = "execClass")]
    pub exec_class: String,
    pub bin: String,
    #[serde(rename = "queueArgs", default)]
    pub queue_args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Parse a service-definition file.
pub fn load_services(path: &Path) -> Result<ServicesFile, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse_services(&raw).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

pub fn parse_services(raw: &str) -> Result<ServicesFile, toml::de::Error> {
    toml::from_str(raw)
}

/// Constructor for a limits policy, given the service it will select for.
pub type LimitsCtor = fn(&ServiceDef) -> Box<dyn JobLimits>;

/// Name-keyed registries replacing the dynamic class lookup of looser
/// runtimes: unknown keys fail fast at load time.
pub struct Registry {
    limits: HashMap<String, LimitsCtor>,
}

impl Registry {
    pub fn new() -> Self {
        let mut limits: HashMap<String, LimitsCtor> = HashMap::new();
        limits.insert("default".into(), |service| {
            let mut names: Vec<String> = service.configurations.keys().cloned().collect();
            names.sort();
            Box::new(DefaultLimits::new(names))
        });
        Registry { limits }
    }

    pub fn register_limits(&mut self, name: impl Into<String>, ctor: LimitsCtor) {
        self.limits.insert(name.into(), ctor);
    }

    fn limits(&self, name: &str) -> Option<LimitsCtor> {
        self.limits.get(name).copied()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// A loaded service: one executor per configuration plus the limits policy
/// that picks among them.
pub struct Service {
    pub executors: HashMap<String, Executor>,
    pub limits: Box<dyn JobLimits>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("executors", &self.executors)
            .finish_non_exhaustive()
    }
}

/// Build a [`Service`] from its declaration. Fails fast on an unknown
/// `execClass` or limits key, a malformed `bin` string, or an ambiguous
/// file result.
pub fn build_service(
    name: &str,
    def: &ServiceDef,
    settings: &Settings,
    registry: &Registry,
) -> Result<Service, ConfigError> {
    let options: Vec<CommandOption> = def
        .options
        .iter()
        .map(|opt| CommandOption::new(&opt.name, &opt.param, opt.default.clone()))
        .collect();

    let mut file_results = Vec::with_capacity(def.result.len());
    for declared in &def.result {
        file_results.push(match (&declared.path, &declared.pattern) {
            (Some(path), None) => FileResult::Path(path.clone()),
            (None, Some(pattern)) => FileResult::Pattern(pattern.clone()),
            _ => return Err(ConfigError::BadFileResult),
        });
    }

    let mut executors = HashMap::new();
    for (conf_name, conf) in &def.configurations {
        let backend = match conf.exec_class.as_str() {
            "ShellExec" => Backend::Shell,
            "LocalExec" => Backend::Local {
                queue_addr: settings.queue_addr,
            },
            "GridEngineExec" => Backend::GridEngine,
            other => return Err(ConfigError::UnknownExecClass(other.to_string())),
        };
        let executor = Executor::new(backend, &conf.bin, settings.work_dir.clone())?
            .with_options(options.clone())
            .with_queue_args(conf.queue_args.clone())
            .with_file_results(file_results.clone())
            .with_env(conf.env.clone());
        executors.insert(conf_name.clone(), executor);
    }

    let ctor = registry
        .limits(&def.limits)
        .ok_or_else(|| ConfigError::UnknownLimits(def.limits.clone()))?;
    let limits = ctor(def);

    debug!(service = name, configurations = executors.len(), "service loaded");
    Ok(Service { executors, limits })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [services.align]
        limits = "default"

        [[services.align.options]]
        ref = "input"
        param = "-i ${value}"

        [[services.align.options]]
        ref = "iterations"
        param = "--iter ${value}"
        val = "2"

        [[services.align.result]]
        path = "aligned.fa"

        [[services.align.result]]
        pattern = "chunk-*.fa"

        [services.align.configurations.local]
        execClass = "LocalExec"
        bin = "clustalo --force"

        [services.align.configurations.cluster]
        execClass = "GridEngineExec"
        bin = "clustalo"
        queueArgs = ["-q", "long.q"]
        env = { OMP_NUM_THREADS = "4" }
    "#;

    fn settings() -> Settings {
        Settings {
            work_dir: std::env::temp_dir(),
            queue_addr: "127.0.0.1:4329".parse().unwrap(),
        }
    }

    #[test]
    fn sample_definition_parses() {
        let file = parse_services(SAMPLE).unwrap();
        let service = &file.services["align"];
        assert_eq!(service.options.len(), 2);
        assert_eq!(service.options[0].name, "input");
        assert_eq!(service.options[1].default.as_deref(), Some("2"));
        assert_eq!(service.configurations.len(), 2);
        assert_eq!(
            service.configurations["cluster"].queue_args,
            ["-q", "long.q"]
        );
    }

    #[test]
    fn build_creates_one_executor_per_configuration() {
        let file = parse_services(SAMPLE).unwrap();
        let service =
            build_service("align", &file.services["align"], &settings(), &Registry::new())
                .unwrap();
        assert_eq!(service.executors.len(), 2);
        assert!(service.executors.contains_key("local"));
        assert!(service.executors.contains_key("cluster"));
    }

    #[test]
    fn default_limits_cover_all_configurations() {
        let file = parse_services(SAMPLE).unwrap();
        let mut service =
            build_service("align", &file.services["align"], &settings(), &Registry::new())
                .unwrap();
        let selected = service.limits.select(&Default::default()).unwrap();
        assert!(service.executors.contains_key(&selected));
    }

    #[test]
    fn unknown_exec_class_fails_fast() {
        let raw = r#"
            [services.bad]
            limits = "default"
            [services.bad.configurations.only]
            execClass = "DockerExec"
            bin = "tool"
        "#;
        let file = parse_services(raw).unwrap();
        let err = build_service("bad", &file.services["bad"], &settings(), &Registry::new())
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownExecClass(name) if name == "DockerExec"));
    }

    #[test]
    fn unknown_limits_key_fails_fast() {
        let raw = r#"
            [services.bad]
            limits = "by_size"
            [services.bad.configurations.only]
            execClass = "ShellExec"
            bin = "tool"
        "#;
        let file = parse_services(raw).unwrap();
        let err = build_service("bad", &file.services["bad"], &settings(), &Registry::new())
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownLimits(name) if name == "by_size"));
    }

    #[test]
    fn registered_limits_are_found() {
        let raw = r#"
            [services.svc]
            limits = "by_size"
            [services.svc.configurations.only]
            execClass = "ShellExec"
            bin = "tool"
        "#;
        let file = parse_services(raw).unwrap();
        let mut registry = Registry::new();
        registry.register_limits("by_size", |service| {
            let names = service.configurations.keys().cloned().collect();
            Box::new(DefaultLimits::new(names))
        });
        assert!(build_service("svc", &file.services["svc"], &settings(), &registry).is_ok());
    }

    #[test]
    fn file_result_must_pick_one_variant() {
        let raw = r#"
            [services.bad]
            limits = "default"
            [[services.bad.result]]
            path = "a.txt"
            pattern = "*.txt"
        "#;
        let file = parse_services(raw).unwrap();
        let err = build_service("bad", &file.services["bad"], &settings(), &Registry::new())
            .unwrap_err();
        assert!(matches!(err, ConfigError::BadFileResult));
    }

    #[test]
    fn work_dir_flag_wins() {
        assert_eq!(
            resolve_work_dir(Some("/srv/jobs")),
            PathBuf::from("/srv/jobs")
        );
    }
}
