use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use anyhow::{bail, Result};

use pipeline_core::runtime::AgentRuntime;

type RuntimeMap = HashMap<String, Arc<dyn AgentRuntime>>;

/// Process-wide registry: populated once during startup, read-only after.
fn registry() -> &'static RwLock<RuntimeMap> {
    static REGISTRY: OnceLock<RwLock<RuntimeMap>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register a runtime under its type tag. Registering the same tag twice is
/// a programming error and fails loudly.
pub fn register(runtime: Arc<dyn AgentRuntime>) -> Result<()> {
    let tag = runtime.type_tag().to_string();
    let mut map = match registry().write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if map.contains_key(&tag) {
        bail!("runtime type {tag:?} is already registered");
    }
    map.insert(tag, runtime);
    Ok(())
}

/// Look up a runtime by tag. The error names the registered tags so a typo
/// in a config is diagnosable.
pub fn get(tag: &str) -> Result<Arc<dyn AgentRuntime>> {
    let map = match registry().read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    match map.get(tag) {
        Some(runtime) => Ok(Arc::clone(runtime)),
        None => {
            let mut available: Vec<&str> = map.keys().map(String::as_str).collect();
            available.sort_unstable();
            bail!(
                "no runtime registered for type {tag:?}; available: [{}]",
                available.join(", ")
            )
        }
    }
}

pub fn registered_tags() -> Vec<String> {
    let map = match registry().read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    let mut tags: Vec<String> = map.keys().cloned().collect();
    tags.sort_unstable();
    tags
}

/// Wipe the registry. For tests only.
#[doc(hidden)]
pub fn clear() {
    let mut map = match registry().write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    map.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pipeline_core::runtime::{
        ExecutionRequest, ExecutionResult, RuntimeCapabilities, ValidationReport,
    };

    struct Dummy {
        tag: &'static str,
    }

    #[async_trait]
    impl AgentRuntime for Dummy {
        fn type_tag(&self) -> &str {
            self.tag
        }

        fn name(&self) -> &str {
            "dummy"
        }

        async fn execute(&self, _request: ExecutionRequest) -> Result<ExecutionResult> {
            Ok(ExecutionResult::default())
        }

        fn capabilities(&self) -> RuntimeCapabilities {
            RuntimeCapabilities {
                supports_streaming: false,
                supports_token_tracking: false,
                supports_mcp: false,
                supports_context_reduction: false,
                available_models: Vec::new(),
                permission_modes: Vec::new(),
            }
        }

        async fn validate(&self) -> ValidationReport {
            ValidationReport::ok()
        }
    }

    // The registry is process-global, so each test uses its own tags and
    // never calls clear() while others may be running.

    #[test]
    fn register_then_get() {
        register(Arc::new(Dummy { tag: "reg-test-a" })).unwrap();
        let rt = get("reg-test-a").unwrap();
        assert_eq!(rt.type_tag(), "reg-test-a");
    }

    #[test]
    fn duplicate_registration_fails() {
        register(Arc::new(Dummy { tag: "reg-test-dup" })).unwrap();
        let err = register(Arc::new(Dummy { tag: "reg-test-dup" })).unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn unknown_tag_error_lists_available() {
        register(Arc::new(Dummy { tag: "reg-test-b" })).unwrap();
        let err = match get("reg-test-no-such") {
            Ok(_) => panic!("expected no runtime registered error"),
            Err(e) => e,
        };
        let msg = err.to_string();
        assert!(msg.contains("reg-test-no-such"));
        assert!(msg.contains("reg-test-b"));
    }
}
