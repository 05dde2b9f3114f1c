//! Bearer-token middleware.
//!
//! Verifies the `Authorization: Bearer` header of every request it wraps and stores the resulting [`JwtClaims`] in the
//! request extensions, where the [`AclMiddlewareFactory`](super::AclMiddlewareFactory) and the handlers find them.
//! Requests without a valid token are rejected with 401.
use std::{
    future::{ready, Ready},
    rc::Rc,
};

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::header::AUTHORIZATION,
    Error,
    HttpMessage,
};
use futures::future::LocalBoxFuture;
use log::*;

use crate::{auth::TokenVerifier, errors::ServerError};

pub struct JwtMiddlewareFactory {
    verifier: TokenVerifier,
}

impl JwtMiddlewareFactory {
    pub fn new(verifier: TokenVerifier) -> Self {
        Self { verifier }
    }
}

impl<S, B> Transform<S, ServiceRequest> for JwtMiddlewareFactory
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Error = Error;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;
    type InitError = ();
    type Response = ServiceResponse<B>;
    type Transform = JwtMiddlewareService<S>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(JwtMiddlewareService { verifier: self.verifier.clone(), service: Rc::new(service) }))
    }
}

pub struct JwtMiddlewareService<S> {
    verifier: TokenVerifier,
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for JwtMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;
    type Response = ServiceResponse<B>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let header = req.headers().get(AUTHORIZATION).and_then(|v| v.to_str().ok());
        let verified = self.verifier.verify_header(header);
        let service = Rc::clone(&self.service);
        Box::pin(async move {
            match verified {
                Ok(claims) => {
                    trace!("🔐️ Authenticated {}:{} for {}", claims.role, claims.sub, req.path());
                    req.extensions_mut().insert(claims);
                    service.call(req).await
                },
                Err(e) => {
                    debug!("🔐️ Unauthenticated request to {}. {e}", req.path());
                    Err(ServerError::from(e).into())
                },
            }
        })
    }
}
