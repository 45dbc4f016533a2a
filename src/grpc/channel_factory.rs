use std::{collections::HashMap, error::Error, str::FromStr, time::Duration};

use log::debug;
use tokio::sync::Mutex;
use tonic::{
    async_trait,
    transport::{Channel, Endpoint},
};
use url::Url;

/// Describes types that can turn URLs into Tonic [channels](Channel).
/// The default implementation creates a plain channel with a connect timeout.
/// By implementing this trait and using your implementation in your [EndNode](crate::EndNode),
/// you can pass extra options to Tonic, like TLS certificates.
#[async_trait]
pub trait TonicChannelFactory {
    async fn channel_for_url(
        &self,
        url: Url,
    ) -> Result<Channel, Box<dyn Error + Send + Sync + 'static>>;

    /// Called after a call over a channel for `url` failed at the transport level.
    /// Caching factories forget the channel so that the next call re-dials.
    async fn invalidate(&self, _url: &Url) {}
}

pub struct DefaultTonicChannelFactory {
    connect_timeout: Duration,
}

impl DefaultTonicChannelFactory {
    /// Builds a cached [TonicChannelFactory] using the default implementation
    pub fn new() -> TonicChannelFactoryCache<DefaultTonicChannelFactory> {
        Self::with_connect_timeout(Duration::from_secs(3))
    }

    pub fn with_connect_timeout(
        connect_timeout: Duration,
    ) -> TonicChannelFactoryCache<DefaultTonicChannelFactory> {
        TonicChannelFactoryCache::new(DefaultTonicChannelFactory { connect_timeout })
    }
}

#[async_trait]
impl TonicChannelFactory for DefaultTonicChannelFactory {
    async fn channel_for_url(
        &self,
        url: Url,
    ) -> Result<Channel, Box<dyn Error + Send + Sync + 'static>> {
        let endpoint = Endpoint::from_str(url.as_str())?;
        let channel = tokio::time::timeout(self.connect_timeout, endpoint.connect())
            .await
            .map_err(|_| format!("timed out connecting to {}", url))??;
        Ok(channel)
    }
}

/// Wraps another struct implementing [TonicChannelFactory] and caches
/// channels so they are reused between calls to [TonicChannelFactory::channel_for_url].
pub struct TonicChannelFactoryCache<F: TonicChannelFactory> {
    factory: F,
    open_channels: Mutex<HashMap<Url, Channel>>,
}

impl<F: TonicChannelFactory + Send + Sync> TonicChannelFactoryCache<F> {
    /// Turns an existing [TonicChannelFactory] into a cached factory that reuses open
    /// channels between calls to [TonicChannelFactory::channel_for_url].
    pub fn new(underlying_factory: F) -> Self {
        Self {
            factory: underlying_factory,
            open_channels: Mutex::new(HashMap::new()),
        }
    }

    pub async fn cached_channels(&self) -> usize {
        self.open_channels.lock().await.len()
    }
}

#[async_trait]
impl<F: TonicChannelFactory + Send + Sync> TonicChannelFactory for TonicChannelFactoryCache<F> {
    async fn channel_for_url(
        &self,
        url: Url,
    ) -> Result<Channel, Box<dyn Error + Send + Sync + 'static>> {
        if let Some(channel) = self.open_channels.lock().await.get(&url) {
            return Ok(channel.clone());
        }
        // dial without holding the lock, a slow peer must not block the others
        let channel = self.factory.channel_for_url(url.clone()).await?;
        let mut guard = self.open_channels.lock().await;
        Ok(guard.entry(url).or_insert(channel).clone())
    }

    async fn invalidate(&self, url: &Url) {
        if self.open_channels.lock().await.remove(url).is_some() {
            debug!("dropped cached channel to {}", url);
        }
        self.factory.invalidate(url).await;
    }
}
