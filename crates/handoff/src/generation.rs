//! Per-process handoff state.
//!
//! [`Startup`] is the registration phase: it decodes the environment once,
//! owns the [`RegistryBuilder`] and hands out listeners through
//! [`Startup::acquire`]. [`Startup::finish`] ends the phase and yields a
//! [`Generation`], whose registry is frozen and safe to read from any task.

use std::ffi::OsString;
use std::sync::Arc;

use tracing::{info, warn};

use crate::codec::{self, HandoffEnv};
use crate::config::HandoffConfig;
use crate::error::Result;
use crate::registry::{Registry, RegistryBuilder};
use crate::shutdown::Coordinator;

/// Registration phase of one process generation.
#[derive(Debug)]
pub struct Startup {
    pub(crate) config: HandoffConfig,
    pub(crate) env: HandoffEnv,
    pub(crate) args: Vec<OsString>,
    pub(crate) registry: RegistryBuilder,
}

impl Startup {
    /// Snapshot this process's environment and arguments.
    pub fn from_env(config: HandoffConfig) -> Result<Self> {
        Self::from_parts(config, std::env::vars_os(), std::env::args_os().skip(1))
    }

    /// Build from an explicit environment and argument list (argv without argv[0]).
    pub fn from_parts<E, A>(config: HandoffConfig, env: E, args: A) -> Result<Self>
    where
        E: IntoIterator<Item = (OsString, OsString)>,
        A: IntoIterator,
        A::Item: Into<OsString>,
    {
        let env = HandoffEnv::decode(&config.env_prefix, env)?;
        if env.has_inherited_handles() {
            info!(listeners = ?env.indices(), "Warm start: inheriting listeners from parent process");
        } else {
            info!("Cold start: no inherited listeners");
        }

        Ok(Self {
            config,
            env,
            args: args.into_iter().map(Into::into).collect(),
            registry: RegistryBuilder::new(),
        })
    }

    /// Whether this process was started by a respawn loop with inherited handles.
    pub fn is_warm(&self) -> bool {
        self.env.has_inherited_handles()
    }

    pub fn config(&self) -> &HandoffConfig {
        &self.config
    }

    pub fn handoff_env(&self) -> &HandoffEnv {
        &self.env
    }

    pub fn registry(&self) -> &RegistryBuilder {
        &self.registry
    }

    /// End registration. No listener can be acquired afterwards.
    pub fn finish(self) -> Generation {
        info!(
            warm = self.env.has_inherited_handles(),
            listeners = self.registry.len(),
            "Listener registration complete"
        );
        if self.registry.is_empty() {
            warn!("No listeners registered; this generation has nothing to serve");
        }
        Generation {
            inner: Arc::new(GenerationInner {
                config: self.config,
                env: self.env,
                args: self.args,
                registry: self.registry.freeze(),
            }),
        }
    }
}

/// Frozen state of one process generation. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Generation {
    inner: Arc<GenerationInner>,
}

#[derive(Debug)]
struct GenerationInner {
    config: HandoffConfig,
    env: HandoffEnv,
    args: Vec<OsString>,
    registry: Registry,
}

impl Generation {
    pub fn is_warm(&self) -> bool {
        self.inner.env.has_inherited_handles()
    }

    pub fn config(&self) -> &HandoffConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn handoff_env(&self) -> &HandoffEnv {
        &self.inner.env
    }

    /// Arguments replayed verbatim to every child.
    pub fn args(&self) -> &[OsString] {
        &self.inner.args
    }

    /// Environment for the next generation: system variables plus freshly
    /// encoded indices for the current registry.
    pub fn child_env(&self) -> Vec<(OsString, OsString)> {
        codec::encode(
            &self.inner.config.env_prefix,
            &self.inner.registry,
            self.inner.env.system_env(),
        )
    }

    /// A lifecycle coordinator for the servers of this generation.
    pub fn coordinator(&self) -> Coordinator {
        Coordinator::new(self.inner.config.grace_period, self.is_warm())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn os(pairs: &[(&str, &str)]) -> Vec<(OsString, OsString)> {
        pairs
            .iter()
            .map(|(k, v)| (OsString::from(k), OsString::from(v)))
            .collect()
    }

    #[test]
    fn test_cold_startup() {
        let startup = Startup::from_parts(
            HandoffConfig::default(),
            os(&[("PATH", "/bin")]),
            ["--port", "8080"],
        )
        .unwrap();
        assert!(!startup.is_warm());

        let generation = startup.finish();
        assert!(!generation.is_warm());
        assert!(generation.registry().is_empty());
        assert_eq!(generation.args(), &[OsString::from("--port"), OsString::from("8080")]);
        assert_eq!(generation.child_env(), os(&[("PATH", "/bin")]));
    }

    #[test]
    fn test_warm_startup_withholds_protocol_vars_from_child() {
        let startup = Startup::from_parts(
            HandoffConfig::default(),
            os(&[("PATH", "/bin"), ("__graceful__http_idx", "0")]),
            Vec::<OsString>::new(),
        )
        .unwrap();
        assert!(startup.is_warm());
        assert_eq!(startup.handoff_env().index_of("http").unwrap(), 0);

        // Nothing re-registered yet, so nothing to hand onward.
        let generation = startup.finish();
        assert_eq!(generation.child_env(), os(&[("PATH", "/bin")]));
    }

    #[test]
    fn test_malformed_environment_fails_startup() {
        let err = Startup::from_parts(
            HandoffConfig::default(),
            os(&[("__graceful__http_idx", "x")]),
            Vec::<OsString>::new(),
        )
        .unwrap_err();
        assert!(matches!(err, crate::HandoffError::HandoffDecode { .. }));
    }
}
