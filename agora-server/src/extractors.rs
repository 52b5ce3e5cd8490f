use std::{
    ops::{Deref, DerefMut},
    sync::Arc,
};

use agora_api::{AuthToken, Db, DbPool, Notifier, User, Uuid};
use anyhow::Context;
use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequest, FromRequestParts, Query},
    http::{self, request, Request},
    Json,
};

use crate::{Error, Links};

#[derive(Clone, axum::extract::FromRef)]
pub struct AppState {
    pub db: DbHandle,
    pub notifier: NotifierHandle,
    pub links: Links,
}

#[derive(Clone)]
pub struct DbHandle(pub Arc<dyn DbPool>);

#[derive(Clone)]
pub struct NotifierHandle(pub Arc<dyn Notifier>);

impl Deref for NotifierHandle {
    type Target = dyn Notifier;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

pub struct DbConn(Box<dyn Db>);

#[async_trait]
impl FromRequestParts<AppState> for DbConn {
    type Rejection = Error;

    async fn from_request_parts(
        _req: &mut request::Parts,
        state: &AppState,
    ) -> Result<DbConn, Error> {
        Ok(DbConn(
            state.db.0.acquire().await.context("acquiring db connection")?,
        ))
    }
}

impl Deref for DbConn {
    type Target = dyn Db;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl DerefMut for DbConn {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.0
    }
}

pub struct PreAuth(pub AuthToken);

#[async_trait]
impl<S: Sync> FromRequestParts<S> for PreAuth {
    type Rejection = Error;

    async fn from_request_parts(req: &mut request::Parts, _state: &S) -> Result<PreAuth, Error> {
        match req.headers.get(http::header::AUTHORIZATION) {
            None => Err(Error::permission_denied()),
            Some(auth) => {
                let auth = auth.to_str().map_err(|_| Error::permission_denied())?;
                let mut auth = auth.split(' ');
                if !auth
                    .next()
                    .ok_or(Error::permission_denied())?
                    .eq_ignore_ascii_case("bearer")
                {
                    return Err(Error::permission_denied());
                }
                let token = auth.next().ok_or(Error::permission_denied())?;
                if !auth.next().is_none() {
                    return Err(Error::permission_denied());
                }
                let token = Uuid::try_from(token).map_err(|_| Error::permission_denied())?;
                Ok(PreAuth(AuthToken(token)))
            }
        }
    }
}

/// The user owning the request's session
pub struct Auth(pub User);

#[async_trait]
impl FromRequestParts<AppState> for Auth {
    type Rejection = Error;

    async fn from_request_parts(req: &mut request::Parts, state: &AppState) -> Result<Auth, Error> {
        let token = PreAuth::from_request_parts(req, state).await?.0;
        let mut conn = DbConn::from_request_parts(req, state).await?;
        let user = conn
            .recover_session(token)
            .await
            .context("recovering session")?
            .ok_or(Error::permission_denied())?;
        tracing::debug!(user = %user.id, "authenticated request");
        Ok(Auth(user))
    }
}

/// JSON request body, rejected with a JSON error when it does not parse
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<S, B, T> FromRequest<S, B> for JsonBody<T>
where
    Json<T>: FromRequest<S, B, Rejection = JsonRejection>,
    S: Send + Sync,
    B: Send + 'static,
{
    type Rejection = Error;

    async fn from_request(req: Request<B>, state: &S) -> Result<JsonBody<T>, Error> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(v)) => Ok(JsonBody(v)),
            Err(rejection) => Err(Error::malformed_body(rejection.to_string())),
        }
    }
}

/// Query string, rejected with a JSON error when it does not parse
pub struct QueryParams<T>(pub T);

#[async_trait]
impl<S, T> FromRequestParts<S> for QueryParams<T>
where
    T: serde::de::DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(
        req: &mut request::Parts,
        state: &S,
    ) -> Result<QueryParams<T>, Error> {
        match Query::<T>::from_request_parts(req, state).await {
            Ok(Query(v)) => Ok(QueryParams(v)),
            Err(rejection) => Err(Error::malformed_body(rejection.to_string())),
        }
    }
}
