// Capability gate for the radio.
//
// Platforms with a runtime permission model (Android-style scan/connect/
// location grants) implement `PermissionGate` against their own dialog
// machinery; desktop builds use `PlatformGate`, which has nothing to ask.

use async_trait::async_trait;

/// One radio capability the platform may require before scanning or
/// connecting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capability {
    Scan,
    Connect,
    Location,
}

#[async_trait]
pub trait PermissionGate: Send + Sync {
    /// The capabilities this platform requires, in the order they must be
    /// requested.
    fn required(&self) -> &[Capability];

    /// Whether the capability is already held. Never prompts.
    async fn check(&self, capability: Capability) -> bool;

    /// Prompt for the capability. Returns the user's verdict.
    async fn request(&self, capability: Capability) -> bool;

    /// Check-then-request every required capability in order and return the
    /// logical AND of the results. Already-held capabilities are not
    /// re-prompted, so repeated calls are safe. A denial is reported once;
    /// re-prompting is the caller's decision.
    async fn request_capabilities(&self) -> bool {
        let mut granted = true;
        for capability in self.required() {
            if self.check(*capability).await {
                continue;
            }
            let ok = self.request(*capability).await;
            if !ok {
                tlog!("[permissions] {:?} denied", capability);
            }
            granted &= ok;
        }
        granted
    }
}

/// Gate for platforms without a runtime capability model. Always grants.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlatformGate;

#[async_trait]
impl PermissionGate for PlatformGate {
    fn required(&self) -> &[Capability] {
        &[]
    }

    async fn check(&self, _capability: Capability) -> bool {
        true
    }

    async fn request(&self, _capability: Capability) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Scripted gate: per-capability held/grant verdicts, records prompts.
    struct ScriptedGate {
        required: Vec<Capability>,
        held: Vec<Capability>,
        denied: Vec<Capability>,
        prompts: Mutex<Vec<Capability>>,
    }

    impl ScriptedGate {
        fn new(required: Vec<Capability>) -> Self {
            Self {
                required,
                held: Vec::new(),
                denied: Vec::new(),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PermissionGate for ScriptedGate {
        fn required(&self) -> &[Capability] {
            &self.required
        }

        async fn check(&self, capability: Capability) -> bool {
            self.held.contains(&capability)
        }

        async fn request(&self, capability: Capability) -> bool {
            self.prompts.lock().unwrap().push(capability);
            !self.denied.contains(&capability)
        }
    }

    #[tokio::test]
    async fn platform_gate_always_grants() {
        assert!(PlatformGate.request_capabilities().await);
    }

    #[tokio::test]
    async fn prompts_in_fixed_order_and_ands_results() {
        let gate = ScriptedGate::new(vec![
            Capability::Scan,
            Capability::Connect,
            Capability::Location,
        ]);
        assert!(gate.request_capabilities().await);
        assert_eq!(
            *gate.prompts.lock().unwrap(),
            vec![Capability::Scan, Capability::Connect, Capability::Location]
        );
    }

    #[tokio::test]
    async fn held_capabilities_are_not_reprompted() {
        let mut gate = ScriptedGate::new(vec![Capability::Scan, Capability::Connect]);
        gate.held = vec![Capability::Scan];
        assert!(gate.request_capabilities().await);
        assert_eq!(*gate.prompts.lock().unwrap(), vec![Capability::Connect]);
    }

    #[tokio::test]
    async fn single_denial_fails_the_whole_request() {
        let mut gate = ScriptedGate::new(vec![
            Capability::Scan,
            Capability::Connect,
            Capability::Location,
        ]);
        gate.denied = vec![Capability::Connect];
        assert!(!gate.request_capabilities().await);
        // Remaining capabilities are still requested; the verdict is the AND.
        assert_eq!(gate.prompts.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn repeated_calls_are_idempotent() {
        let mut gate = ScriptedGate::new(vec![Capability::Scan]);
        gate.held = vec![Capability::Scan];
        assert!(gate.request_capabilities().await);
        assert!(gate.request_capabilities().await);
        assert!(gate.prompts.lock().unwrap().is_empty());
    }
}
