//! HMAC middleware for Actix Web.
//!
//! The payment collaborator signs its callbacks with the shared `PAYMENT_CALLBACK_SECRET`. The signature is the hex
//! HMAC-SHA256 of the raw request body, sent in the `X-HomeChef-Signature` header, exactly as HomeChef signs its own
//! outbound webhooks.
//!
//! The body is read in full to check the signature and then put back, so the handler can still extract it.
use std::{
    future::{ready, Ready},
    rc::Rc,
};

use actix_http::h1;
use actix_web::{
    dev::{forward_ready, Payload, Service, ServiceRequest, ServiceResponse, Transform},
    web,
    Error,
};
use futures::future::LocalBoxFuture;
use hc_common::Secret;
use homechef_engine::webhooks::signer;
use log::*;

use crate::errors::{AuthError, ServerError};

pub struct HmacMiddlewareFactory {
    hmac_header: String,
    // If None, the middleware does not check the signature and always allows the call
    key: Option<Secret<String>>,
}

impl HmacMiddlewareFactory {
    pub fn new(hmac_header: &str, key: Option<Secret<String>>) -> Self {
        HmacMiddlewareFactory { hmac_header: hmac_header.into(), key }
    }
}

impl<S, B> Transform<S, ServiceRequest> for HmacMiddlewareFactory
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Error = Error;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;
    type InitError = ();
    type Response = ServiceResponse<B>;
    type Transform = HmacMiddlewareService<S>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(HmacMiddlewareService {
            hmac_header: self.hmac_header.clone(),
            key: self.key.clone(),
            service: Rc::new(service),
        }))
    }
}

pub struct HmacMiddlewareService<S> {
    hmac_header: String,
    key: Option<Secret<String>>,
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for HmacMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;
    type Response = ServiceResponse<B>;

    forward_ready!(service);

    fn call(&self, mut req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        let key = self.key.clone();
        let hmac_header = self.hmac_header.clone();
        Box::pin(async move {
            let Some(key) = key else {
                trace!("🔐️ HMAC checks are disabled. Allowing request.");
                return service.call(req).await;
            };
            let data = req.extract::<web::Bytes>().await.map_err(|e| {
                warn!("🔐️ Failed to extract request data: {e:?}");
                ServerError::invalid_request("Failed to extract request data.")
            })?;
            let signature = req.headers().get(&hmac_header).and_then(|v| v.to_str().ok()).ok_or_else(|| {
                warn!("🔐️ No HMAC signature found in request to {}. Denying access.", req.path());
                ServerError::from(AuthError::ValidationError("No HMAC signature found.".into()))
            })?;
            let validated = signer::verify(key.reveal().as_bytes(), data.as_ref(), signature).unwrap_or_else(|e| {
                warn!("🔐️ Could not check the HMAC signature. {e}");
                false
            });
            if validated {
                trace!("🔐️ HMAC check for request ✅️");
                req.set_payload(bytes_to_payload(data));
                service.call(req).await
            } else {
                warn!("🔐️ Invalid HMAC signature found in request to {}. Denying access.", req.path());
                Err(ServerError::from(AuthError::ValidationError("Invalid HMAC signature.".into())).into())
            }
        })
    }
}

fn bytes_to_payload(buf: web::Bytes) -> Payload {
    let (_, mut pl) = h1::Payload::create(true);
    pl.unread_data(buf);
    Payload::from(pl)
}
