//! Shared fixtures for idempotency BDD scenarios.

use std::cell::RefCell;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use hcloud_csi::test_support::ScriptedVolumeService;
use hcloud_csi::{ControllerService, IdempotentVolumeService, RetryPolicy};
use rstest::fixture;
use tokio::runtime::Runtime;
use tonic::Code;

pub const LOCATION: &str = "fsn1";

pub static RUNTIME: LazyLock<Runtime> = LazyLock::new(|| {
    Runtime::new().unwrap_or_else(|err| panic!("tokio runtime should start for scenarios: {err}"))
});

/// Result of one RPC: the returned volume id, if any, or the status code.
pub type Outcome = Result<Option<String>, Code>;

pub struct ControllerWorld {
    pub provider: ScriptedVolumeService,
    pub controller: ControllerService,
    pub volume_id: RefCell<Option<String>>,
    pub outcomes: RefCell<Vec<Outcome>>,
}

impl ControllerWorld {
    pub fn volume_id(&self) -> String {
        self.volume_id
            .borrow()
            .clone()
            .unwrap_or_else(|| panic!("scenario should seed a volume first"))
    }

    pub fn record(&self, outcomes: impl IntoIterator<Item = Outcome>) {
        self.outcomes.borrow_mut().extend(outcomes);
    }
}

fn scenario_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 10,
        base_delay: Duration::from_millis(50),
        jitter: Duration::ZERO,
        ..RetryPolicy::default()
    }
}

#[fixture]
pub fn world() -> ControllerWorld {
    let provider = ScriptedVolumeService::new();
    let volumes =
        IdempotentVolumeService::new(Arc::new(provider.clone())).with_policy(scenario_policy());
    ControllerWorld {
        provider,
        controller: ControllerService::new(Arc::new(volumes), LOCATION),
        volume_id: RefCell::new(None),
        outcomes: RefCell::new(Vec::new()),
    }
}
