//! Launcher seam.
//!
//! Starting a configuration asks a [`Launcher`] to spawn its runners on their
//! hosts. The launcher reports back through a [`LaunchCompletion`], which can
//! only be finished once; dropping it unfinished reports a cancellation.

use std::fmt;

use crate::loader::LoadedConfiguration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchOutcome {
    Completed,
    Cancelled,
}

type Notify = Box<dyn FnOnce(&str, LaunchOutcome) + Send>;

/// One-shot completion handle for a launch request.
pub struct LaunchCompletion {
    configuration: String,
    notify: Option<Notify>,
}

impl LaunchCompletion {
    pub fn new(
        configuration: impl Into<String>,
        notify: impl FnOnce(&str, LaunchOutcome) + Send + 'static,
    ) -> Self {
        Self {
            configuration: configuration.into(),
            notify: Some(Box::new(notify)),
        }
    }

    #[must_use]
    pub fn configuration(&self) -> &str {
        &self.configuration
    }

    pub fn finish(mut self, outcome: LaunchOutcome) {
        if let Some(notify) = self.notify.take() {
            notify(&self.configuration, outcome);
        }
    }
}

impl Drop for LaunchCompletion {
    fn drop(&mut self) {
        if let Some(notify) = self.notify.take() {
            tracing::warn!(
                configuration = %self.configuration,
                "launch completion dropped without finishing; reporting cancellation"
            );
            notify(&self.configuration, LaunchOutcome::Cancelled);
        }
    }
}

impl fmt::Debug for LaunchCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchCompletion")
            .field("configuration", &self.configuration)
            .field("pending", &self.notify.is_some())
            .finish()
    }
}

/// Spawns the runners of a configuration.
pub trait Launcher: Send + Sync {
    fn launch(&self, configuration: &LoadedConfiguration, completion: LaunchCompletion);
}

/// Launcher for deployments where runners are started out of band. It only
/// logs the request and completes at once.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExternalLauncher;

impl Launcher for ExternalLauncher {
    fn launch(&self, configuration: &LoadedConfiguration, completion: LaunchCompletion) {
        for runner in &configuration.runners {
            tracing::info!(
                configuration = %configuration.name,
                runner = %runner.name(),
                host = %runner.host(),
                "expecting externally started runner"
            );
        }
        completion.finish(LaunchOutcome::Completed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<(String, LaunchOutcome)>>>, LaunchCompletion) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let completion = LaunchCompletion::new("alpha", move |name, outcome| {
            sink.lock().unwrap().push((name.to_string(), outcome));
        });
        (seen, completion)
    }

    #[test]
    fn finish_notifies_once() {
        let (seen, completion) = recorder();
        completion.finish(LaunchOutcome::Completed);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("alpha".to_string(), LaunchOutcome::Completed)]
        );
    }

    #[test]
    fn drop_reports_cancelled() {
        let (seen, completion) = recorder();
        drop(completion);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("alpha".to_string(), LaunchOutcome::Cancelled)]
        );
    }
}
