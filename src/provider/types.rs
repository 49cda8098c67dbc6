use super::GenerateError;
use futures_core::stream::BoxStream;

/// One `response` value from the upstream stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub text: String,
}

pub type FragmentStream = BoxStream<'static, Result<Fragment, GenerateError>>;

pub type StartFuture = std::pin::Pin<
    Box<dyn std::future::Future<Output = Result<FragmentStream, GenerateError>> + Send>,
>;

/// Text generation backend.
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start one exchange and stream its fragments in arrival order.
    ///
    /// The stream ends when the exchange is over, whether the upstream closed,
    /// finished, or ran out of time.
    fn stream_generate(&self, prompt: String) -> StartFuture;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelKind {
    Llama,
    Mistral,
    Gptj,
    #[default]
    Custom,
}

impl ModelKind {
    /// Unrecognised names fall back to `Custom`.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "llama" => Self::Llama,
            "mistral" => Self::Mistral,
            "gptj" => Self::Gptj,
            _ => Self::Custom,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Llama => "LLaMA",
            Self::Mistral => "Mistral",
            Self::Gptj => "GPT-J",
            Self::Custom => "Custom/Ollama",
        }
    }
}

/// Model parameters sent with every upstream request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOptions {
    pub model: ModelKind,
    pub model_path: Option<String>,
    pub temperature: f64,
    pub max_tokens: u32,
    pub context_size: u32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            model: ModelKind::Custom,
            model_path: None,
            temperature: 0.7,
            max_tokens: 512,
            context_size: 2048,
        }
    }
}

impl GenerationOptions {
    /// Name of the model the upstream service should run.
    pub fn model_name(&self) -> &str {
        match self.model {
            ModelKind::Llama => "llama3",
            ModelKind::Mistral => "mistral",
            ModelKind::Gptj => "phi3",
            ModelKind::Custom => self
                .model_path
                .as_deref()
                .filter(|p| !p.trim().is_empty())
                .unwrap_or("llama3"),
        }
    }
}
