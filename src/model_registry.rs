use bigdecimal::BigDecimal;
use serde::Serialize;
use std::collections::HashMap;

pub const TOOL_WEATHER: &str = "get_weather";
pub const TOOL_CREATE_DOCUMENT: &str = "create_document";
pub const TOOL_UPDATE_DOCUMENT: &str = "update_document";
pub const TOOL_REQUEST_SUGGESTIONS: &str = "request_suggestions";
pub const TOOL_GENERATE_IMAGE: &str = "generate_image";
pub const TOOL_ANIME_STYLE: &str = "anime_style";
pub const TOOL_CLOTHING_SWAP: &str = "clothing_swap";
pub const TOOL_GENERATE_SLIDES: &str = "generate_slides";
pub const TOOL_REPHRASE: &str = "rephrase_text";
pub const TOOL_CITATIONS: &str = "find_citations";
pub const TOOL_YOUTUBE: &str = "summarize_youtube";

const ASSISTANT_TOOLS: &[&str] = &[
    TOOL_WEATHER,
    TOOL_CREATE_DOCUMENT,
    TOOL_UPDATE_DOCUMENT,
    TOOL_REQUEST_SUGGESTIONS,
];

const ASSISTANT_TOOLS_WITH_IMAGES: &[&str] = &[
    TOOL_WEATHER,
    TOOL_CREATE_DOCUMENT,
    TOOL_UPDATE_DOCUMENT,
    TOOL_REQUEST_SUGGESTIONS,
    TOOL_GENERATE_IMAGE,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    OpenAi,
    AzureOpenAi,
    AzureInference,
    Anthropic,
    Google,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Chat,
    Image,
    Video,
    Presentation,
    Writing,
    Research,
}

/// How a model is executed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ModelKind {
    /// Streamed from a provider; `tools` are offered to the model.
    Chat {
        provider: Provider,
        upstream_model: &'static str,
        tools: &'static [&'static str],
    },
    /// A single tool run directly on the last user message.
    Bot {
        tool: &'static str,
        /// Provider used by bots that summarize with a model after the tool call.
        summarizer: Option<(Provider, &'static str)>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pricing {
    /// Dollars per prompt token.
    pub input_cost_per_token: BigDecimal,
    /// Dollars per completion token.
    pub output_cost_per_token: BigDecimal,
    pub api_cost_in_cents: BigDecimal,
    pub image_cost_in_cents: BigDecimal,
    pub tool_call_cost_in_cents: BigDecimal,
}

impl Pricing {
    fn tokens(input: BigDecimal, output: BigDecimal) -> Self {
        Self {
            input_cost_per_token: input,
            output_cost_per_token: output,
            api_cost_in_cents: BigDecimal::from(0),
            image_cost_in_cents: BigDecimal::from(0),
            tool_call_cost_in_cents: BigDecimal::from(0),
        }
    }

    fn flat(api_cost_in_cents: BigDecimal) -> Self {
        Self {
            api_cost_in_cents,
            ..Self::tokens(BigDecimal::from(0), BigDecimal::from(0))
        }
    }

    fn with_image_cost(mut self, cents: BigDecimal) -> Self {
        self.image_cost_in_cents = cents;
        self
    }

    fn with_api_cost(mut self, cents: BigDecimal) -> Self {
        self.api_cost_in_cents = cents;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Capabilities {
    pub supports_streaming: bool,
    pub accepts_images: bool,
    pub accepts_files: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelDescriptor {
    pub id: &'static str,
    pub label: &'static str,
    pub description: &'static str,
    pub guidelines: &'static str,
    pub category: Category,
    pub kind: ModelKind,
    pub pricing: Pricing,
    pub capabilities: Capabilities,
}

impl ModelDescriptor {
    pub fn is_bot(&self) -> bool {
        matches!(self.kind, ModelKind::Bot { .. })
    }

    pub fn provider(&self) -> Option<Provider> {
        match &self.kind {
            ModelKind::Chat { provider, .. } => Some(*provider),
            ModelKind::Bot { summarizer, .. } => summarizer.map(|(p, _)| p),
        }
    }
}

/// `mantissa * 10^-scale`, e.g. `rate(25, 7)` is 2.5e-6.
fn rate(mantissa: i64, scale: i64) -> BigDecimal {
    BigDecimal::new(mantissa.into(), scale)
}

const CHAT_CAPS: Capabilities = Capabilities {
    supports_streaming: true,
    accepts_images: true,
    accepts_files: true,
};

const TEXT_ONLY_CAPS: Capabilities = Capabilities {
    supports_streaming: true,
    accepts_images: false,
    accepts_files: false,
};

const BOT_CAPS: Capabilities = Capabilities {
    supports_streaming: false,
    accepts_images: false,
    accepts_files: false,
};

const IMAGE_BOT_CAPS: Capabilities = Capabilities {
    supports_streaming: false,
    accepts_images: true,
    accepts_files: false,
};

/// Read-only catalog of selectable models, built once at startup.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: Vec<ModelDescriptor>,
    index: HashMap<&'static str, usize>,
}

impl ModelRegistry {
    pub fn new(models: Vec<ModelDescriptor>) -> Self {
        let index = models
            .iter()
            .enumerate()
            .map(|(i, m)| (m.id, i))
            .collect();
        Self { models, index }
    }

    pub fn builtin() -> Self {
        Self::new(builtin_models())
    }

    pub fn get(&self, id: &str) -> Option<&ModelDescriptor> {
        self.index.get(id).map(|&i| &self.models[i])
    }

    pub fn by_provider(&self, provider: Provider) -> Vec<&ModelDescriptor> {
        self.models
            .iter()
            .filter(|m| m.provider() == Some(provider))
            .collect()
    }

    pub fn by_category(&self, category: Category) -> Vec<&ModelDescriptor> {
        self.models
            .iter()
            .filter(|m| m.category == category)
            .collect()
    }

    pub fn all(&self) -> &[ModelDescriptor] {
        &self.models
    }
}

fn builtin_models() -> Vec<ModelDescriptor> {
    vec![
        ModelDescriptor {
            id: "gpt-4o-azure",
            label: "GPT-4o",
            description: "OpenAI's flagship model for complex, multi-step tasks",
            guidelines: "Best for detailed answers, documents and image understanding.",
            category: Category::Chat,
            kind: ModelKind::Chat {
                provider: Provider::AzureOpenAi,
                upstream_model: "gpt-4o",
                tools: ASSISTANT_TOOLS_WITH_IMAGES,
            },
            pricing: Pricing::tokens(rate(25, 7), rate(1, 5)).with_image_cost(BigDecimal::from(4)),
            capabilities: CHAT_CAPS,
        },
        ModelDescriptor {
            id: "gpt-4o-mini",
            label: "GPT-4o mini",
            description: "Small, fast model for everyday tasks",
            guidelines: "Cheapest option for quick questions.",
            category: Category::Chat,
            kind: ModelKind::Chat {
                provider: Provider::OpenAi,
                upstream_model: "gpt-4o-mini",
                tools: ASSISTANT_TOOLS,
            },
            pricing: Pricing::tokens(rate(15, 8), rate(6, 7)),
            capabilities: CHAT_CAPS,
        },
        ModelDescriptor {
            id: "o3-mini",
            label: "o3-mini",
            description: "Reasoning model for math, science and code",
            guidelines: "Takes longer to answer; best for step-by-step problems.",
            category: Category::Chat,
            kind: ModelKind::Chat {
                provider: Provider::OpenAi,
                upstream_model: "o3-mini",
                tools: ASSISTANT_TOOLS,
            },
            pricing: Pricing::tokens(rate(11, 7), rate(44, 7)),
            capabilities: TEXT_ONLY_CAPS,
        },
        ModelDescriptor {
            id: "claude-3-5-sonnet",
            label: "Claude 3.5 Sonnet",
            description: "Anthropic's most capable model for writing and code",
            guidelines: "Strong at long-form writing and careful reasoning.",
            category: Category::Chat,
            kind: ModelKind::Chat {
                provider: Provider::Anthropic,
                upstream_model: "claude-3-5-sonnet-latest",
                tools: ASSISTANT_TOOLS,
            },
            pricing: Pricing::tokens(rate(3, 6), rate(15, 6)),
            capabilities: CHAT_CAPS,
        },
        ModelDescriptor {
            id: "claude-3-5-haiku",
            label: "Claude 3.5 Haiku",
            description: "Anthropic's fastest model",
            guidelines: "Quick answers and summaries.",
            category: Category::Chat,
            kind: ModelKind::Chat {
                provider: Provider::Anthropic,
                upstream_model: "claude-3-5-haiku-latest",
                tools: ASSISTANT_TOOLS,
            },
            pricing: Pricing::tokens(rate(8, 7), rate(4, 6)),
            capabilities: TEXT_ONLY_CAPS,
        },
        ModelDescriptor {
            id: "gemini-2.0-flash",
            label: "Gemini 2.0 Flash",
            description: "Google's fast multimodal model",
            guidelines: "Good with images and long context.",
            category: Category::Chat,
            kind: ModelKind::Chat {
                provider: Provider::Google,
                upstream_model: "gemini-2.0-flash",
                tools: ASSISTANT_TOOLS,
            },
            pricing: Pricing::tokens(rate(1, 7), rate(4, 7)),
            capabilities: CHAT_CAPS,
        },
        ModelDescriptor {
            id: "gemini-1.5-pro",
            label: "Gemini 1.5 Pro",
            description: "Google's model for complex reasoning over long inputs",
            guidelines: "Use for large documents.",
            category: Category::Chat,
            kind: ModelKind::Chat {
                provider: Provider::Google,
                upstream_model: "gemini-1.5-pro",
                tools: ASSISTANT_TOOLS,
            },
            pricing: Pricing::tokens(rate(125, 8), rate(5, 6)),
            capabilities: CHAT_CAPS,
        },
        ModelDescriptor {
            id: "deepseek-r1",
            label: "DeepSeek R1",
            description: "Open reasoning model",
            guidelines: "Shows its reasoning; no tool use.",
            category: Category::Chat,
            kind: ModelKind::Chat {
                provider: Provider::AzureInference,
                upstream_model: "DeepSeek-R1",
                tools: &[],
            },
            pricing: Pricing::tokens(rate(55, 8), rate(219, 8)),
            capabilities: TEXT_ONLY_CAPS,
        },
        ModelDescriptor {
            id: "deepseek-v3",
            label: "DeepSeek V3",
            description: "Open general-purpose chat model",
            guidelines: "Everyday chat at a low price.",
            category: Category::Chat,
            kind: ModelKind::Chat {
                provider: Provider::AzureInference,
                upstream_model: "DeepSeek-V3",
                tools: &[],
            },
            pricing: Pricing::tokens(rate(27, 8), rate(11, 7)),
            capabilities: TEXT_ONLY_CAPS,
        },
        ModelDescriptor {
            id: "dall-e-3",
            label: "DALL·E 3",
            description: "Generate an image from a text prompt",
            guidelines: "Describe the picture you want in one message.",
            category: Category::Image,
            kind: ModelKind::Bot {
                tool: TOOL_GENERATE_IMAGE,
                summarizer: None,
            },
            pricing: Pricing::flat(BigDecimal::from(4)),
            capabilities: BOT_CAPS,
        },
        ModelDescriptor {
            id: "anime-style",
            label: "Anime Style",
            description: "Turn a photo into anime art",
            guidelines: "Attach one photo of a face.",
            category: Category::Image,
            kind: ModelKind::Bot {
                tool: TOOL_ANIME_STYLE,
                summarizer: None,
            },
            pricing: Pricing::flat(BigDecimal::from(2)),
            capabilities: IMAGE_BOT_CAPS,
        },
        ModelDescriptor {
            id: "clothing-swap",
            label: "Clothing Swap",
            description: "Try a garment on a model photo",
            guidelines: "Attach a photo of a person, then a photo of the garment.",
            category: Category::Image,
            kind: ModelKind::Bot {
                tool: TOOL_CLOTHING_SWAP,
                summarizer: None,
            },
            pricing: Pricing::flat(BigDecimal::from(3)),
            capabilities: IMAGE_BOT_CAPS,
        },
        ModelDescriptor {
            id: "slide-speak",
            label: "Slide Generator",
            description: "Create a presentation from a topic",
            guidelines: "Give a topic and optionally the number of slides.",
            category: Category::Presentation,
            kind: ModelKind::Bot {
                tool: TOOL_GENERATE_SLIDES,
                summarizer: None,
            },
            pricing: Pricing::flat(BigDecimal::from(10)),
            capabilities: BOT_CAPS,
        },
        ModelDescriptor {
            id: "rephrasy",
            label: "Humanizer",
            description: "Rewrite text so it reads naturally",
            guidelines: "Paste the text you want rewritten.",
            category: Category::Writing,
            kind: ModelKind::Bot {
                tool: TOOL_REPHRASE,
                summarizer: None,
            },
            pricing: Pricing::flat(BigDecimal::from(1)),
            capabilities: BOT_CAPS,
        },
        ModelDescriptor {
            id: "citation-finder",
            label: "Citation Finder",
            description: "Find academic references for a claim or topic",
            guidelines: "Describe the claim you need sources for.",
            category: Category::Research,
            kind: ModelKind::Bot {
                tool: TOOL_CITATIONS,
                summarizer: None,
            },
            pricing: Pricing::flat(rate(5, 1)),
            capabilities: BOT_CAPS,
        },
        ModelDescriptor {
            id: "youtube-summarizer",
            label: "YouTube Summarizer",
            description: "Summarize a YouTube video from its transcript",
            guidelines: "Paste a YouTube link.",
            category: Category::Video,
            kind: ModelKind::Bot {
                tool: TOOL_YOUTUBE,
                summarizer: Some((Provider::OpenAi, "gpt-4o-mini")),
            },
            pricing: Pricing::tokens(rate(15, 8), rate(6, 7)).with_api_cost(BigDecimal::from(1)),
            capabilities: BOT_CAPS,
        },
    ]
}
