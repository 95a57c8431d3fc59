use async_trait::async_trait;
use fantoccini::ClientBuilder;
use thiserror::Error;

pub const DEFAULT_WEBDRIVER_URL: &str = "http://localhost:4444";
pub const WEBDRIVER_URL_VAR: &str = "WEBDRIVER_URL";

/// Renderer-level failure: session startup, navigation, or markup read.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to start renderer session: {0}")]
    Session(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("failed to read page markup: {0}")]
    Markup(String),
}

/// Renders a URL to client-side-complete document markup. Every `open`
/// starts a fresh session; callers own its teardown.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn open(&self, url: &str) -> Result<Box<dyn PageSession>, RenderError>;
}

/// A live rendered page. `markup` may be called repeatedly without
/// re-navigating, so callers can poll for late-arriving script output.
#[async_trait]
pub trait PageSession: Send {
    async fn markup(&mut self) -> Result<String, RenderError>;
    async fn close(self: Box<Self>) -> Result<(), RenderError>;
}

/// Production renderer: a WebDriver endpoint driving headless Chrome.
pub struct WebDriver {
    endpoint: String,
}

impl WebDriver {
    pub fn from_env() -> Self {
        let endpoint = std::env::var(WEBDRIVER_URL_VAR)
            .unwrap_or_else(|_| DEFAULT_WEBDRIVER_URL.to_string());
        WebDriver { endpoint }
    }

    /// Probe the endpoint once so an unavailable renderer fails the whole
    /// invocation up front instead of failing every item.
    pub async fn check_available(&self) -> Result<(), RenderError> {
        let client = self.connect().await?;
        client
            .close()
            .await
            .map_err(|e| RenderError::Session(e.to_string()))
    }

    async fn connect(&self) -> Result<fantoccini::Client, RenderError> {
        let mut caps = serde_json::map::Map::new();
        caps.insert(
            "goog:chromeOptions".to_string(),
            serde_json::json!({ "args": ["--headless=new", "--disable-gpu"] }),
        );
        let mut builder = ClientBuilder::native();
        builder.capabilities(caps);
        builder
            .connect(&self.endpoint)
            .await
            .map_err(|e| RenderError::Session(e.to_string()))
    }
}

#[async_trait]
impl PageRenderer for WebDriver {
    async fn open(&self, url: &str) -> Result<Box<dyn PageSession>, RenderError> {
        let mut client = self.connect().await?;
        if let Err(e) = client.goto(url).await {
            let _ = client.close().await;
            return Err(RenderError::Navigation(e.to_string()));
        }
        Ok(Box::new(WebDriverSession { client }))
    }
}

struct WebDriverSession {
    client: fantoccini::Client,
}

#[async_trait]
impl PageSession for WebDriverSession {
    async fn markup(&mut self) -> Result<String, RenderError> {
        self.client
            .source()
            .await
            .map_err(|e| RenderError::Markup(e.to_string()))
    }

    async fn close(self: Box<Self>) -> Result<(), RenderError> {
        self.client
            .close()
            .await
            .map_err(|e| RenderError::Session(e.to_string()))
    }
}

// ── Test fakes ──
