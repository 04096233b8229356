use std::sync::Arc;

use crate::{
    auth::JwtKeys,
    cache::Cache,
    config::AppConfig,
    ratelimit::IpRateLimiter,
    users::{repo::UserStore, services::UserService},
};

/// Everything a request handler may need, built once at startup.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn UserStore>,
    pub tokens: JwtKeys,
    pub users: UserService,
    pub limiter: Option<Arc<IpRateLimiter>>,
}

impl AppState {
    pub fn from_parts(
        config: Arc<AppConfig>,
        store: Arc<dyn UserStore>,
        cache: Arc<dyn Cache>,
    ) -> anyhow::Result<Self> {
        let tokens = JwtKeys::from_config(&config.jwt);
        let users = UserService::new(store.clone(), cache, tokens.clone());
        let limiter = if config.rate_limit.enabled {
            Some(Arc::new(IpRateLimiter::from_config(&config.rate_limit)?))
        } else {
            None
        };
        Ok(Self {
            store,
            tokens,
            users,
            limiter,
        })
    }

    #[cfg(test)]
    pub fn fake() -> Self {
        Self::fake_with(crate::config::test_config())
    }

    #[cfg(test)]
    pub fn fake_with(config: AppConfig) -> Self {
        use crate::testing::{InMemoryUserStore, MemoryCache};

        Self::from_parts(
            Arc::new(config),
            Arc::new(InMemoryUserStore::default()),
            Arc::new(MemoryCache::default()),
        )
        .expect("test config is valid")
    }
}
