//! Environment encoding of the descriptor table.
//!
//! The descriptors themselves travel through ordinary fd inheritance; the
//! environment only carries `<prefix><name>_idx=<index>` so the child can
//! tell which inherited slot belongs to which listener.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::os::fd::RawFd;

use tracing::debug;

use crate::error::{HandoffError, Result};
use crate::registry::Registry;

/// First inherited descriptor slot (0–2 are stdin, stdout and stderr).
pub const LISTEN_FDS_START: RawFd = 3;

/// Suffix of the per-listener index variable.
pub const IDX_SUFFIX: &str = "_idx";

/// Key of the index variable for `name`.
pub fn idx_key(prefix: &str, name: &str) -> String {
    format!("{prefix}{name}{IDX_SUFFIX}")
}

/// Build the child's environment: `base_system_env` verbatim, followed by
/// one index variable per registry entry in handoff order.
pub fn encode(
    prefix: &str,
    registry: &Registry,
    base_system_env: &[(OsString, OsString)],
) -> Vec<(OsString, OsString)> {
    let mut env = Vec::with_capacity(base_system_env.len() + registry.len());
    env.extend_from_slice(base_system_env);
    env.extend(registry.all().iter().map(|entry| {
        (
            OsString::from(idx_key(prefix, entry.name())),
            OsString::from(entry.handoff_index().to_string()),
        )
    }));
    env
}

/// The environment of this process, split once at startup into protocol
/// variables (decoded) and system variables (kept verbatim for the child).
#[derive(Debug, Clone, Default)]
pub struct HandoffEnv {
    prefix: String,
    system: Vec<(OsString, OsString)>,
    indices: BTreeMap<String, usize>,
    protocol_vars: usize,
}

impl HandoffEnv {
    /// Partition `env` in a single pass.
    ///
    /// Every variable whose key starts with `prefix` is a protocol variable and
    /// is withheld from the system snapshot, even when it is not an index
    /// variable. Index values must be decimal integers below 65536.
    pub fn decode<I>(prefix: &str, env: I) -> Result<Self>
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        let mut decoded = Self {
            prefix: prefix.to_string(),
            ..Self::default()
        };

        for (key, value) in env {
            let Some(protocol_key) = key.to_str().and_then(|k| k.strip_prefix(prefix)) else {
                decoded.system.push((key, value));
                continue;
            };
            decoded.protocol_vars += 1;

            let Some(name) = protocol_key.strip_suffix(IDX_SUFFIX).filter(|n| !n.is_empty()) else {
                debug!(key = protocol_key, "Ignoring unknown handoff variable");
                continue;
            };

            let raw = value.to_string_lossy();
            let index: u16 = raw.parse().map_err(|source| HandoffError::HandoffDecode {
                key: idx_key(prefix, name),
                value: raw.to_string(),
                source,
            })?;
            decoded.indices.insert(name.to_string(), usize::from(index));
        }

        Ok(decoded)
    }

    /// True iff at least one protocol variable was present.
    pub fn has_inherited_handles(&self) -> bool {
        self.protocol_vars > 0
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Non-protocol variables in their original order.
    pub fn system_env(&self) -> &[(OsString, OsString)] {
        &self.system
    }

    /// Decoded name to handoff index mapping.
    pub fn indices(&self) -> &BTreeMap<String, usize> {
        &self.indices
    }

    pub fn index_of(&self, name: &str) -> Result<usize> {
        self.indices
            .get(name)
            .copied()
            .ok_or_else(|| HandoffError::NotFound {
                name: name.to_string(),
            })
    }

    /// Inherited descriptor number for `name`: its index plus [`LISTEN_FDS_START`].
    pub fn resolve_handoff_slot(&self, name: &str) -> Result<RawFd> {
        let index = self.index_of(name)?;
        // Indices are bounded by u16 at decode time.
        Ok(LISTEN_FDS_START + index as RawFd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::dev_null;
    use crate::registry::{DescriptorKind, RegistryBuilder};

    const PREFIX: &str = "__graceful__";

    fn os_env(pairs: &[(&str, &str)]) -> Vec<(OsString, OsString)> {
        pairs
            .iter()
            .map(|(k, v)| (OsString::from(k), OsString::from(v)))
            .collect()
    }

    fn registry_of(names: &[&str]) -> Registry {
        let mut builder = RegistryBuilder::new();
        for name in names {
            builder.register(name, dev_null(), DescriptorKind::Socket).unwrap();
        }
        builder.freeze()
    }

    #[test]
    fn test_idx_key() {
        assert_eq!(idx_key(PREFIX, "http"), "__graceful__http_idx");
    }

    #[test]
    fn test_encode_appends_after_system_env() {
        let base = os_env(&[("PATH", "/usr/bin"), ("HOME", "/root")]);
        let env = encode(PREFIX, &registry_of(&["a", "b"]), &base);
        assert_eq!(
            env,
            os_env(&[
                ("PATH", "/usr/bin"),
                ("HOME", "/root"),
                ("__graceful__a_idx", "0"),
                ("__graceful__b_idx", "1"),
            ])
        );
    }

    #[test]
    fn test_round_trip_for_empty_single_and_many() {
        for names in [&[][..], &["http"][..], &["http", "admin", "c2s", "s2s", "x"][..]] {
            let registry = registry_of(names);
            let base = os_env(&[("LANG", "C.UTF-8")]);
            let decoded = HandoffEnv::decode(PREFIX, encode(PREFIX, &registry, &base)).unwrap();

            let expected: BTreeMap<String, usize> = registry
                .all()
                .iter()
                .map(|e| (e.name().to_string(), e.handoff_index()))
                .collect();
            assert_eq!(decoded.indices(), &expected);
            assert_eq!(decoded.system_env(), &base[..]);
            assert_eq!(decoded.has_inherited_handles(), !names.is_empty());
        }
    }

    #[test]
    fn test_resolve_slot_is_index_plus_three() {
        let env = os_env(&[("__graceful__a_idx", "0"), ("__graceful__b_idx", "1")]);
        let decoded = HandoffEnv::decode(PREFIX, env).unwrap();
        assert_eq!(decoded.resolve_handoff_slot("a").unwrap(), 3);
        assert_eq!(decoded.resolve_handoff_slot("b").unwrap(), 4);
        assert!(matches!(
            decoded.resolve_handoff_slot("c"),
            Err(HandoffError::NotFound { ref name }) if name == "c"
        ));
    }

    #[test]
    fn test_cold_environment() {
        let decoded = HandoffEnv::decode(PREFIX, os_env(&[("PATH", "/bin")])).unwrap();
        assert!(!decoded.has_inherited_handles());
        assert!(decoded.indices().is_empty());
        assert_eq!(decoded.system_env().len(), 1);
    }

    #[test]
    fn test_prefix_must_lead_the_key() {
        let env = os_env(&[("X__graceful__a_idx", "0")]);
        let decoded = HandoffEnv::decode(PREFIX, env).unwrap();
        assert!(!decoded.has_inherited_handles());
        assert_eq!(decoded.system_env().len(), 1);
    }

    #[test]
    fn test_unknown_protocol_variable_is_withheld() {
        let env = os_env(&[("__graceful__a_type", "http"), ("USER", "svc")]);
        let decoded = HandoffEnv::decode(PREFIX, env).unwrap();
        assert!(decoded.has_inherited_handles());
        assert!(decoded.indices().is_empty());
        assert_eq!(decoded.system_env(), &os_env(&[("USER", "svc")])[..]);
    }

    #[test]
    fn test_malformed_index() {
        for bad in ["", "three", "-1", "70000"] {
            let env = os_env(&[("__graceful__a_idx", bad)]);
            let err = HandoffEnv::decode(PREFIX, env).unwrap_err();
            assert!(
                matches!(err, HandoffError::HandoffDecode { ref key, .. } if key == "__graceful__a_idx"),
                "value {bad:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn test_custom_prefix() {
        let env = os_env(&[("__graceful__a_idx", "0"), ("__svc__b_idx", "0")]);
        let decoded = HandoffEnv::decode("__svc__", env).unwrap();
        assert_eq!(decoded.index_of("b").unwrap(), 0);
        assert!(decoded.index_of("a").is_err());
        assert_eq!(decoded.system_env().len(), 1);
    }
}
