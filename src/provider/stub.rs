use super::{Fragment, FragmentStream, GenerateError, Provider, StartFuture};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Echoes the prompt back in a few fragments. Needs no upstream service.
#[derive(Debug, Default, Clone)]
pub struct StubProvider {
    delay: std::time::Duration,
}

impl StubProvider {
    pub fn new() -> Self {
        Self::with_delay(std::time::Duration::from_millis(120))
    }

    /// Pause for `delay` before each fragment.
    pub fn with_delay(delay: std::time::Duration) -> Self {
        Self { delay }
    }

    /// No pause between fragments.
    pub fn instant() -> Self {
        Self::default()
    }
}

impl Provider for StubProvider {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn stream_generate(&self, prompt: String) -> StartFuture {
        let delay = self.delay;

        Box::pin(async move {
            let (tx, rx) = mpsc::channel::<Result<Fragment, GenerateError>>(32);

            tokio::spawn(async move {
                let parts = ["You said: ", prompt.as_str()];
                for p in parts {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    if tx.send(Ok(Fragment { text: p.to_string() })).await.is_err() {
                        break;
                    }
                }
            });

            Ok(Box::pin(ReceiverStream::new(rx)) as FragmentStream)
        })
    }
}
