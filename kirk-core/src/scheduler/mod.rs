//! Scheduling layer: turns a flat test list, or a sequence of suites, into SUT `run` calls,
//! watching the kernel for panic/taint/unresponsiveness around each one and rebooting between
//! suites when one of those fires.

pub mod suite_scheduler;
pub mod test_scheduler;

pub use suite_scheduler::{SuiteScheduler, SuiteSchedulerConfig};
pub use test_scheduler::{TestScheduler, TestSchedulerConfig};

use async_trait::async_trait;

use crate::event_bus::{EventBus, KirkEvent};
use crate::sut::IoBuffer;

/// Fans a running test's stdout out onto the event bus as it arrives.
pub struct RedirectTestStdout {
    test_name: String,
    events: EventBus,
}

impl RedirectTestStdout {
    pub fn new(test_name: String, events: EventBus) -> Self {
        Self { test_name, events }
    }
}

#[async_trait]
impl IoBuffer for RedirectTestStdout {
    async fn write(&self, data: &str) {
        self.events.fire(KirkEvent::TestStdout {
            test_name: self.test_name.clone(),
            data: data.to_string(),
        });
    }
}

/// Fans a SUT's stdout (start/stop/reboot) out onto the event bus as it arrives.
pub struct RedirectSutStdout {
    sut_name: String,
    events: EventBus,
}

impl RedirectSutStdout {
    pub fn new(sut_name: String, events: EventBus) -> Self {
        Self { sut_name, events }
    }
}

#[async_trait]
impl IoBuffer for RedirectSutStdout {
    async fn write(&self, data: &str) {
        self.events.fire(KirkEvent::SutStdout {
            name: self.sut_name.clone(),
            data: data.to_string(),
        });
    }
}
