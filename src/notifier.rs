/// Fire-and-forget operator notifications. Delivery failures are logged and
/// never reach the caller.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, title: &str, message: &str);
}

/// Writes notifications to the log only
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, title: &str, message: &str) {
        tracing::warn!(title, "{}", message);
    }
}

/// Desktop notification through `notify-send`, also logged
#[derive(Debug, Clone)]
pub struct DesktopNotifier {
    program: String,
}

impl Default for DesktopNotifier {
    fn default() -> Self {
        Self {
            program: "notify-send".to_string(),
        }
    }
}

impl DesktopNotifier {
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait::async_trait]
impl Notifier for DesktopNotifier {
    async fn notify(&self, title: &str, message: &str) {
        tracing::warn!(title, "{}", message);
        let spawned = tokio::process::Command::new(&self.program)
            .arg("--app-name=imgfacet")
            .arg(title)
            .arg(message)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn();
        if let Err(e) = spawned {
            tracing::debug!(program = %self.program, error = %e, "desktop notification unavailable");
        }
    }
}
