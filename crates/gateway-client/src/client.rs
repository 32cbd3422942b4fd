use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::auth;
use crate::cache::CachedResource;
use crate::config::GatewayConfig;
use crate::error::{ClientError, SharedClientError};
use crate::identity::{IdentityStore, Session};
use crate::resolver::IdentityResolver;
use crate::storage::{FileStorage, KeyValueStorage, MemoryStorage};
use crate::stream::{ChatStream, StreamingEngine};
use crate::transport::{AuthenticatedTransport, SessionEvent};
use crate::types::{ChatRequest, UserProfile};

/// Session-scoped entry point owning the identity store, transport,
/// identity resolver and chat streaming engine.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    config: GatewayConfig,
    identity_store: Arc<IdentityStore>,
    transport: AuthenticatedTransport,
    resolver: IdentityResolver,
    streaming: StreamingEngine,
}

impl GatewayClient {
    /// Durable session in `config.state_path` when set, otherwise in memory.
    pub fn new(config: GatewayConfig) -> Result<Self, ClientError> {
        let durable: Arc<dyn KeyValueStorage> = match &config.state_path {
            Some(path) => Arc::new(FileStorage::load(path.clone())),
            None => Arc::new(MemoryStorage::new()),
        };
        Self::with_storage(config, durable, Arc::new(MemoryStorage::new()))
    }

    pub fn from_env() -> Result<Self, ClientError> {
        Self::new(GatewayConfig::from_env()?)
    }

    pub fn with_storage(
        config: GatewayConfig,
        durable: Arc<dyn KeyValueStorage>,
        ephemeral: Arc<dyn KeyValueStorage>,
    ) -> Result<Self, ClientError> {
        let identity_store = Arc::new(IdentityStore::new(durable, ephemeral));
        let transport = AuthenticatedTransport::new(&config, Arc::clone(&identity_store))?;
        let resolver = IdentityResolver::new(transport.clone());
        let invalidate_on_reply = resolver.clone();
        let streaming = StreamingEngine::new(transport.clone(), config.stream)
            .with_completion_hook(move || invalidate_on_reply.invalidate());
        Ok(Self {
            config,
            identity_store,
            transport,
            resolver,
            streaming,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn transport(&self) -> &AuthenticatedTransport {
        &self.transport
    }

    pub fn identity_store(&self) -> &Arc<IdentityStore> {
        &self.identity_store
    }

    pub fn identity(&self) -> &IdentityResolver {
        &self.resolver
    }

    pub fn session(&self) -> Option<Session> {
        self.identity_store.session()
    }

    pub fn is_signed_in(&self) -> bool {
        self.identity_store.get_token().is_some()
    }

    pub fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.transport.subscribe()
    }

    pub async fn login(
        &self,
        email: &str,
        password: &str,
        remember: bool,
    ) -> Result<UserProfile, ClientError> {
        let response = auth::login(&self.transport, email, password).await?;
        self.start_session(&response.token, response.user, remember)
    }

    pub async fn signup(
        &self,
        email: &str,
        password: &str,
        name: &str,
        remember: bool,
    ) -> Result<UserProfile, ClientError> {
        let response = auth::signup(&self.transport, email, password, name).await?;
        self.start_session(&response.token, response.user, remember)
    }

    fn start_session(
        &self,
        token: &str,
        profile: UserProfile,
        remember: bool,
    ) -> Result<UserProfile, ClientError> {
        self.resolver.reset();
        self.identity_store.set_session(token, &profile, remember)?;
        tracing::info!(user_id = %profile.id, remember, "signed in");
        Ok(profile)
    }

    /// Local sign-out: the gateway has no session to revoke.
    pub fn logout(&self) {
        self.resolver.reset();
        self.identity_store.clear_session();
        tracing::info!("signed out");
    }

    /// Current profile through the single-flight resolver.
    pub async fn me(&self) -> Result<UserProfile, SharedClientError> {
        self.resolver.get_identity().await
    }

    /// A revalidating cache entry backed by this session's ephemeral storage.
    pub fn cached<T, F, Fut>(&self, key: &str, fetcher: F) -> CachedResource<T>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ClientError>> + Send + 'static,
    {
        CachedResource::new(key, self.identity_store.ephemeral_storage(), fetcher)
    }

    pub async fn open_chat_stream(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChatStream, ClientError> {
        self.streaming.open(request, cancel).await
    }

    pub async fn stream_chat<F>(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
        on_delta: F,
    ) -> Result<String, ClientError>
    where
        F: FnMut(&str),
    {
        self.streaming.stream_chat(request, cancel, on_delta).await
    }
}
