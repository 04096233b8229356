use std::{sync::Arc, time::Duration};

use tracing::{debug, info, instrument, warn};

use super::{
    dto::{LoginRequest, RegisterRequest, UpdateUserRequest},
    repo::{StoreError, UserStore},
    repo_types::{NewUser, User, UserProfile},
};
use crate::{
    auth::{
        password::{hash_password_blocking, verify_password_blocking},
        JwtKeys,
    },
    cache::{self, Cache, CacheError},
    error::{AppError, AppResult},
};

pub const USER_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

pub fn user_cache_key(id: i64) -> String {
    format!("user:{id}")
}

/// Business logic for user accounts. Cheap to clone; every dependency is shared.
#[derive(Clone)]
pub struct UserService {
    store: Arc<dyn UserStore>,
    cache: Arc<dyn Cache>,
    tokens: JwtKeys,
}

impl UserService {
    pub fn new(store: Arc<dyn UserStore>, cache: Arc<dyn Cache>, tokens: JwtKeys) -> Self {
        Self {
            store,
            cache,
            tokens,
        }
    }

    /// The username pre-check is only a fast path for a friendly error; two
    /// concurrent registrations can both pass it, and the store's unique
    /// constraint decides. Both paths surface as `AlreadyExists`.
    #[instrument(skip(self, req), fields(username = %req.username))]
    pub async fn create_user(&self, req: RegisterRequest) -> AppResult<UserProfile> {
        match self.store.get_by_username(&req.username).await {
            Ok(_) => {
                warn!("username already registered");
                return Err(AppError::AlreadyExists("username already exists".into()));
            }
            Err(StoreError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        let password_hash = hash_password_blocking(req.password).await?;

        let user = self
            .store
            .create(NewUser {
                username: req.username,
                password_hash,
                email: req.email,
            })
            .await
            .map_err(|e| {
                if matches!(e, StoreError::DuplicateKey) {
                    warn!("username taken by a concurrent registration");
                }
                AppError::from(e)
            })?;

        info!(user_id = user.id, "user registered");
        Ok(user.into())
    }

    /// Read-through: cache first, store on miss, then best-effort write-back.
    #[instrument(skip(self))]
    pub async fn get_user_by_id(&self, id: i64) -> AppResult<UserProfile> {
        let key = user_cache_key(id);
        match cache::get_json::<UserProfile>(self.cache.as_ref(), &key).await {
            Ok(profile) => {
                debug!(%key, "cache hit");
                return Ok(profile);
            }
            Err(CacheError::Miss) => debug!(%key, "cache miss"),
            Err(e) => warn!(%key, error = %e, "cache read failed; falling back to store"),
        }

        let profile = UserProfile::from(self.store.get_by_id(id).await?);

        if let Err(e) = cache::set_json(self.cache.as_ref(), &key, &profile, USER_CACHE_TTL).await {
            warn!(%key, error = %e, "failed to set cache");
        }
        Ok(profile)
    }

    /// Unknown username and wrong password yield the same error.
    #[instrument(skip(self, password))]
    pub async fn validate_user(&self, username: &str, password: &str) -> AppResult<User> {
        let user = match self.store.get_by_username(username).await {
            Ok(user) => user,
            Err(StoreError::NotFound) => {
                info!("login for unknown username");
                return Err(AppError::InvalidCredentials);
            }
            Err(e) => return Err(e.into()),
        };

        let ok = verify_password_blocking(password.to_owned(), user.password_hash.clone()).await?;
        if !ok {
            info!(user_id = user.id, "login with wrong password");
            return Err(AppError::InvalidCredentials);
        }
        Ok(user)
    }

    #[instrument(skip(self, req), fields(username = %req.username))]
    pub async fn login(&self, req: LoginRequest) -> AppResult<String> {
        let user = self.validate_user(&req.username, &req.password).await?;
        let token = self.tokens.issue(user.id)?;
        info!(user_id = user.id, "user logged in");
        Ok(token)
    }

    #[instrument(skip(self, req))]
    pub async fn update_user(&self, id: i64, req: UpdateUserRequest) -> AppResult<UserProfile> {
        let mut user = self.store.get_by_id(id).await?;

        if let Some(email) = req.email {
            user.email = email;
        }
        if let Some(password) = req.password {
            user.password_hash = hash_password_blocking(password).await?;
        }

        let updated = self.store.update(&user).await?;
        self.invalidate(id).await;
        info!(user_id = id, "user updated");
        Ok(updated.into())
    }

    #[instrument(skip(self))]
    pub async fn delete_user(&self, id: i64) -> AppResult<()> {
        self.store.delete(id).await?;
        self.invalidate(id).await;
        info!(user_id = id, "user deleted");
        Ok(())
    }

    /// Drops the cached snapshot after a write. Failure only risks a stale read
    /// until the entry expires.
    async fn invalidate(&self, id: i64) {
        let key = user_cache_key(id);
        if let Err(e) = self.cache.delete(&key).await {
            warn!(%key, error = %e, "cache invalidation failed");
        }
    }
}
