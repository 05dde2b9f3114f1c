//! Request handler definitions
//!
//! Define each route and its handler here. Handlers delegate to the engine APIs, which own authorisation against the
//! order and endpoint records; the ACL wrapped around each route only gates on the caller's role.
//!
//! Since each worker thread processes its requests sequentially, handlers must never block the current thread. All
//! I/O goes through the async engine APIs.
use actix_web::{get, web, HttpResponse, Responder};
use homechef_engine::{
    db_types::{NewCancellationPolicy, NewOrder, NewTip, NewWebhookEndpoint, OrderId, Role, UpdateWebhookEndpoint},
    hce_api::{
        order_objects::{
            AssignDeliveryRequest,
            CancelOrderRequest,
            ChefAcceptRequest,
            ChefDeclineRequest,
            PaymentCallback,
            StatusUpdateRequest,
        },
        webhook_objects::DeliveryQuery,
    },
    traits::{CancellationPolicyManagement, HomeChefDatabase, WebhookManagement},
    OrderFlowApi,
    PolicyApi,
    WebhookApi,
};
use log::*;

use crate::{
    auth::JwtClaims,
    data_objects::{AnalyticsQuery, HealthResponse, JsonResponse},
    errors::ServerError,
    hub::HubHandle,
};

// Web-actix cannot handle generics in handlers, so it's implemented manually using the `route!` macro
#[macro_export]
macro_rules! route {
    ($name:ident => $method:ident $path:literal requires [$($roles:expr),+]) => {
        paste::paste! { pub struct [<$name:camel Route>];}
        paste::paste! {
            impl [<$name:camel Route>] {
                #[allow(clippy::new_without_default)]
                pub fn new() -> Self { Self }
            }
        }
        paste::paste! {
            impl actix_web::dev::HttpServiceFactory for [<$name:camel Route>] {
                fn register(self, config: &mut actix_web::dev::AppService) {
                    let res = actix_web::Resource::new($path)
                        .name(stringify!($name))
                        .guard(actix_web::guard::$method())
                        .to($name)
                        .wrap($crate::middleware::AclMiddlewareFactory::new(&[$($roles),+]));
                    actix_web::dev::HttpServiceFactory::register(res, config);
                }
            }
        }
    };

    ($name:ident => $method:ident $path:literal impl $bound:path) => {
        paste::paste! { pub struct [<$name:camel Route>]<B>(core::marker::PhantomData<fn() -> B>);}
        paste::paste! { impl<B> [<$name:camel Route>]<B> {
            #[allow(clippy::new_without_default)]
            pub fn new() -> Self {
                Self(core::marker::PhantomData::<fn() -> B>)
            }
        }}
        paste::paste! { impl<B> actix_web::dev::HttpServiceFactory for [<$name:camel Route>]<B>
        where B: $bound + 'static
        {
            fn register(self, config: &mut actix_web::dev::AppService) {
                let res = actix_web::Resource::new($path)
                    .name(stringify!($name))
                    .guard(actix_web::guard::$method())
                    .to($name::<B>);
                actix_web::dev::HttpServiceFactory::register(res, config);
            }
        }}
    };

    ($name:ident => $method:ident $path:literal impl $bound:path where requires [$($roles:expr),+]) => {
        paste::paste! { pub struct [<$name:camel Route>]<B>(core::marker::PhantomData<fn() -> B>);}
        paste::paste! { impl<B> [<$name:camel Route>]<B> {
            #[allow(clippy::new_without_default)]
            pub fn new() -> Self {
                Self(core::marker::PhantomData::<fn() -> B>)
            }
        }}
        paste::paste! { impl<B> actix_web::dev::HttpServiceFactory for [<$name:camel Route>]<B>
        where B: $bound + 'static
        {
            fn register(self, config: &mut actix_web::dev::AppService) {
                let res = actix_web::Resource::new($path)
                    .name(stringify!($name))
                    .guard(actix_web::guard::$method())
                    .to($name::<B>)
                    .wrap($crate::middleware::AclMiddlewareFactory::new(&[$($roles),+]));
                actix_web::dev::HttpServiceFactory::register(res, config);
            }
        }}
    };
}

// ----------------------------------------------   Health  ----------------------------------------------------
#[get("/health")]
pub async fn health() -> impl Responder {
    trace!("💻️ Received health check request");
    HttpResponse::Ok().json(JsonResponse::data(HealthResponse {
        status: "ok".into(),
        version: env!("CARGO_PKG_VERSION").into(),
    }))
}

//----------------------------------------------   Orders  ----------------------------------------------------
route!(place_order => Post "/orders" impl HomeChefDatabase where requires [Role::Customer]);
/// Places an order for the calling customer. The response carries the order, including its `countdown_expiry`.
pub async fn place_order<B: HomeChefDatabase>(
    claims: JwtClaims,
    body: web::Json<NewOrder>,
    api: web::Data<OrderFlowApi<B>>,
) -> Result<HttpResponse, ServerError> {
    debug!("💻️ POST order for {}", claims.sub);
    let order = api.place_order(&claims.principal(), body.into_inner()).await?;
    Ok(HttpResponse::Created().json(JsonResponse::with_message(order, "Order placed")))
}

route!(order_by_id => Get "/orders/{id}" impl HomeChefDatabase);
pub async fn order_by_id<B: HomeChefDatabase>(
    claims: JwtClaims,
    path: web::Path<OrderId>,
    api: web::Data<OrderFlowApi<B>>,
) -> Result<HttpResponse, ServerError> {
    let id = path.into_inner();
    trace!("💻️ GET order {id} for {}", claims.sub);
    let order = api.get_order(&claims.principal(), id).await?;
    Ok(HttpResponse::Ok().json(JsonResponse::data(order)))
}

route!(order_timeline => Get "/orders/{id}/timeline" impl HomeChefDatabase);
pub async fn order_timeline<B: HomeChefDatabase>(
    claims: JwtClaims,
    path: web::Path<OrderId>,
    api: web::Data<OrderFlowApi<B>>,
) -> Result<HttpResponse, ServerError> {
    let id = path.into_inner();
    trace!("💻️ GET timeline for order {id}");
    let timeline = api.order_timeline(&claims.principal(), id).await?;
    Ok(HttpResponse::Ok().json(JsonResponse::data(timeline)))
}

route!(countdown_status => Get "/orders/{id}/countdown-status" impl HomeChefDatabase);
pub async fn countdown_status<B: HomeChefDatabase>(
    claims: JwtClaims,
    path: web::Path<OrderId>,
    api: web::Data<OrderFlowApi<B>>,
) -> Result<HttpResponse, ServerError> {
    let status = api.countdown_status(&claims.principal(), path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(JsonResponse::data(status)))
}

route!(cancel_order => Post "/orders/{id}/cancel" impl HomeChefDatabase where requires [Role::Customer]);
/// Cancels an order on behalf of its customer. Free inside the cancellation window, penalised after it.
pub async fn cancel_order<B: HomeChefDatabase>(
    claims: JwtClaims,
    path: web::Path<OrderId>,
    body: Option<web::Json<CancelOrderRequest>>,
    api: web::Data<OrderFlowApi<B>>,
) -> Result<HttpResponse, ServerError> {
    let id = path.into_inner();
    let reason = body.and_then(|b| b.into_inner().reason);
    debug!("💻️ POST cancel order {id} for {}", claims.sub);
    let receipt = api.cancel_order(&claims.principal(), id, reason).await?;
    Ok(HttpResponse::Ok().json(JsonResponse::with_message(receipt, "Order cancelled")))
}

route!(chef_accept => Post "/orders/{id}/chef/accept" impl HomeChefDatabase where requires [Role::Chef]);
pub async fn chef_accept<B: HomeChefDatabase>(
    claims: JwtClaims,
    path: web::Path<OrderId>,
    body: Option<web::Json<ChefAcceptRequest>>,
    api: web::Data<OrderFlowApi<B>>,
) -> Result<HttpResponse, ServerError> {
    let id = path.into_inner();
    let prep = body.and_then(|b| b.into_inner().estimated_prep_time);
    debug!("💻️ POST chef accept for order {id}");
    let order = api.chef_accept(&claims.principal(), id, prep).await?;
    Ok(HttpResponse::Ok().json(JsonResponse::with_message(order, "Order accepted")))
}

route!(chef_decline => Post "/orders/{id}/chef/decline" impl HomeChefDatabase where requires [Role::Chef]);
pub async fn chef_decline<B: HomeChefDatabase>(
    claims: JwtClaims,
    path: web::Path<OrderId>,
    body: web::Json<ChefDeclineRequest>,
    api: web::Data<OrderFlowApi<B>>,
) -> Result<HttpResponse, ServerError> {
    let id = path.into_inner();
    debug!("💻️ POST chef decline for order {id}");
    let order = api.chef_decline(&claims.principal(), id, body.into_inner().reason).await?;
    Ok(HttpResponse::Ok().json(JsonResponse::with_message(order, "Order declined")))
}

route!(update_status => Put "/orders/{id}/status" impl HomeChefDatabase where requires [Role::Chef, Role::Delivery]);
/// Moves an order along the kitchen and delivery stages. The engine checks that the caller is the order's chef or its
/// assigned delivery partner, as the target status demands.
pub async fn update_status<B: HomeChefDatabase>(
    claims: JwtClaims,
    path: web::Path<OrderId>,
    body: web::Json<StatusUpdateRequest>,
    api: web::Data<OrderFlowApi<B>>,
) -> Result<HttpResponse, ServerError> {
    let id = path.into_inner();
    let StatusUpdateRequest { status, proof } = body.into_inner();
    debug!("💻️ PUT status {status} for order {id}");
    let order = api.update_status(&claims.principal(), id, status, proof).await?;
    Ok(HttpResponse::Ok().json(JsonResponse::data(order)))
}

route!(assign_delivery => Post "/orders/{id}/delivery/assign" impl HomeChefDatabase where requires [Role::Delivery, Role::Admin]);
pub async fn assign_delivery<B: HomeChefDatabase>(
    claims: JwtClaims,
    path: web::Path<OrderId>,
    body: Option<web::Json<AssignDeliveryRequest>>,
    api: web::Data<OrderFlowApi<B>>,
) -> Result<HttpResponse, ServerError> {
    let id = path.into_inner();
    let partner = body.and_then(|b| b.into_inner().delivery_partner_id);
    debug!("💻️ POST assign delivery for order {id}");
    let order = api.assign_delivery(&claims.principal(), id, partner).await?;
    Ok(HttpResponse::Ok().json(JsonResponse::with_message(order, "Delivery partner assigned")))
}

route!(add_tip => Post "/orders/{id}/tip" impl HomeChefDatabase where requires [Role::Customer]);
pub async fn add_tip<B: HomeChefDatabase>(
    claims: JwtClaims,
    path: web::Path<OrderId>,
    body: web::Json<NewTip>,
    api: web::Data<OrderFlowApi<B>>,
) -> Result<HttpResponse, ServerError> {
    let id = path.into_inner();
    debug!("💻️ POST tip for order {id}");
    let tip = api.add_tip(&claims.principal(), id, body.into_inner()).await?;
    Ok(HttpResponse::Created().json(JsonResponse::with_message(tip, "Tip recorded. Awaiting payment")))
}

route!(order_tips => Get "/orders/{id}/tips" impl HomeChefDatabase);
pub async fn order_tips<B: HomeChefDatabase>(
    claims: JwtClaims,
    path: web::Path<OrderId>,
    api: web::Data<OrderFlowApi<B>>,
) -> Result<HttpResponse, ServerError> {
    let tips = api.tips_for_order(&claims.principal(), path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(JsonResponse::data(tips)))
}

//----------------------------------------------   Payments  ----------------------------------------------------
route!(payment_callback => Post "/callback" impl HomeChefDatabase);
/// Receives the payment collaborator's verdicts at `/payments/callback`. The route is not behind the JWT middleware;
/// the server mounts it in the `/payments` scope, behind the HMAC middleware.
pub async fn payment_callback<B: HomeChefDatabase>(
    body: web::Json<PaymentCallback>,
    api: web::Data<OrderFlowApi<B>>,
) -> Result<HttpResponse, ServerError> {
    let callback = body.into_inner();
    info!("💻️ Payment callback {} for order {}: {:?}", callback.payment_id, callback.order_id, callback.status);
    match api.handle_payment_callback(callback).await? {
        Some(order) => Ok(HttpResponse::Ok().json(JsonResponse::with_message(order, "Payment recorded"))),
        None => Ok(HttpResponse::Ok().json(JsonResponse::success("Callback acknowledged. Nothing to update"))),
    }
}

//----------------------------------------------   Cancellation policy  ----------------------------------------------
route!(active_policy => Get "/cancellation-policy" impl CancellationPolicyManagement);
pub async fn active_policy<B: CancellationPolicyManagement>(
    api: web::Data<PolicyApi<B>>,
) -> Result<HttpResponse, ServerError> {
    let policy = api.active_policy().await?;
    Ok(HttpResponse::Ok().json(JsonResponse::data(policy)))
}

route!(replace_policy => Put "/cancellation-policy" impl CancellationPolicyManagement where requires [Role::Admin]);
/// Creates a new active policy version. Orders already placed keep the policy they were placed under.
pub async fn replace_policy<B: CancellationPolicyManagement>(
    claims: JwtClaims,
    body: web::Json<NewCancellationPolicy>,
    api: web::Data<PolicyApi<B>>,
) -> Result<HttpResponse, ServerError> {
    info!("💻️ {} is replacing the cancellation policy", claims.sub);
    let policy = api.replace_policy(&claims.principal(), body.into_inner()).await?;
    Ok(HttpResponse::Ok().json(JsonResponse::with_message(policy, "Cancellation policy updated")))
}

route!(cancellation_analytics => Get "/analytics/cancellations" impl CancellationPolicyManagement where requires [Role::Admin]);
pub async fn cancellation_analytics<B: CancellationPolicyManagement>(
    claims: JwtClaims,
    query: web::Query<AnalyticsQuery>,
    api: web::Data<PolicyApi<B>>,
) -> Result<HttpResponse, ServerError> {
    let AnalyticsQuery { from, to } = query.into_inner();
    trace!("💻️ GET cancellation analytics {from} to {to}");
    let rows = api.cancellation_analytics(&claims.principal(), from, to).await?;
    Ok(HttpResponse::Ok().json(JsonResponse::data(rows)))
}

//----------------------------------------------   Webhooks  ----------------------------------------------------
route!(event_catalogue => Get "/webhooks/events" impl WebhookManagement);
pub async fn event_catalogue<B: WebhookManagement>() -> Result<HttpResponse, ServerError> {
    Ok(HttpResponse::Ok().json(JsonResponse::data(WebhookApi::<B>::event_catalogue())))
}

route!(create_webhook => Post "/webhooks" impl WebhookManagement);
/// Registers an endpoint for the caller. The signing secret is only ever returned in this response.
pub async fn create_webhook<B: WebhookManagement>(
    claims: JwtClaims,
    body: web::Json<NewWebhookEndpoint>,
    api: web::Data<WebhookApi<B>>,
) -> Result<HttpResponse, ServerError> {
    debug!("💻️ POST webhook endpoint for {}", claims.sub);
    let created = api.create_endpoint(&claims.principal(), body.into_inner()).await?;
    Ok(HttpResponse::Created().json(JsonResponse::with_message(created, "Store the secret now. It is not shown again")))
}

route!(my_webhooks => Get "/webhooks" impl WebhookManagement);
pub async fn my_webhooks<B: WebhookManagement>(
    claims: JwtClaims,
    api: web::Data<WebhookApi<B>>,
) -> Result<HttpResponse, ServerError> {
    let endpoints = api.list_endpoints(&claims.principal()).await?;
    Ok(HttpResponse::Ok().json(JsonResponse::data(endpoints)))
}

route!(webhook_by_id => Get "/webhooks/{id}" impl WebhookManagement);
pub async fn webhook_by_id<B: WebhookManagement>(
    claims: JwtClaims,
    path: web::Path<i64>,
    api: web::Data<WebhookApi<B>>,
) -> Result<HttpResponse, ServerError> {
    let endpoint = api.get_endpoint(&claims.principal(), path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(JsonResponse::data(endpoint)))
}

route!(update_webhook => Put "/webhooks/{id}" impl WebhookManagement);
pub async fn update_webhook<B: WebhookManagement>(
    claims: JwtClaims,
    path: web::Path<i64>,
    body: web::Json<UpdateWebhookEndpoint>,
    api: web::Data<WebhookApi<B>>,
) -> Result<HttpResponse, ServerError> {
    let id = path.into_inner();
    debug!("💻️ PUT webhook endpoint {id}");
    let endpoint = api.update_endpoint(&claims.principal(), id, body.into_inner()).await?;
    Ok(HttpResponse::Ok().json(JsonResponse::with_message(endpoint, "Webhook endpoint updated")))
}

route!(delete_webhook => Delete "/webhooks/{id}" impl WebhookManagement);
pub async fn delete_webhook<B: WebhookManagement>(
    claims: JwtClaims,
    path: web::Path<i64>,
    api: web::Data<WebhookApi<B>>,
) -> Result<HttpResponse, ServerError> {
    let id = path.into_inner();
    debug!("💻️ DELETE webhook endpoint {id}");
    api.delete_endpoint(&claims.principal(), id).await?;
    Ok(HttpResponse::Ok().json(JsonResponse::success("Webhook endpoint deleted")))
}

route!(test_webhook => Post "/webhooks/{id}/test" impl WebhookManagement);
/// Sends a `webhook.test` delivery to the endpoint right away and returns the delivery record.
pub async fn test_webhook<B: WebhookManagement>(
    claims: JwtClaims,
    path: web::Path<i64>,
    api: web::Data<WebhookApi<B>>,
) -> Result<HttpResponse, ServerError> {
    let id = path.into_inner();
    debug!("💻️ POST test fire for webhook endpoint {id}");
    let delivery = api.test_endpoint(&claims.principal(), id).await?;
    Ok(HttpResponse::Ok().json(JsonResponse::data(delivery)))
}

route!(webhook_deliveries => Get "/webhooks/{id}/deliveries" impl WebhookManagement);
pub async fn webhook_deliveries<B: WebhookManagement>(
    claims: JwtClaims,
    path: web::Path<i64>,
    query: web::Query<DeliveryQuery>,
    api: web::Data<WebhookApi<B>>,
) -> Result<HttpResponse, ServerError> {
    let deliveries = api.list_deliveries(&claims.principal(), path.into_inner(), query.into_inner()).await?;
    Ok(HttpResponse::Ok().json(JsonResponse::data(deliveries)))
}

route!(retry_delivery => Post "/webhooks/deliveries/{id}/retry" impl WebhookManagement);
pub async fn retry_delivery<B: WebhookManagement>(
    claims: JwtClaims,
    path: web::Path<i64>,
    api: web::Data<WebhookApi<B>>,
) -> Result<HttpResponse, ServerError> {
    let id = path.into_inner();
    info!("💻️ {} requested a retry of delivery #{id}", claims.sub);
    let delivery = api.retry_delivery(&claims.principal(), id).await?;
    Ok(HttpResponse::Ok().json(JsonResponse::with_message(delivery, "Delivery queued for retry")))
}

//----------------------------------------------   WebSocket hub  ----------------------------------------------------
route!(hub_stats => Get "/ws/stats" requires [Role::Admin]);
pub async fn hub_stats(hub: web::Data<HubHandle>) -> Result<HttpResponse, ServerError> {
    let stats = hub.stats().await.ok_or_else(|| ServerError::internal("The connection hub is not running"))?;
    Ok(HttpResponse::Ok().json(JsonResponse::data(stats)))
}
