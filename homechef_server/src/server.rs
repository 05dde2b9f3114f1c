use std::{fs::File, io::BufReader, path::Path, sync::Arc, time::Duration};

use actix_web::{
    dev::{Server, ServerHandle, Service},
    error::{JsonPayloadError, PathError, QueryPayloadError},
    http::KeepAlive,
    middleware::Logger,
    web,
    App,
    HttpRequest,
    HttpServer,
};
use homechef_engine::{
    clock::{SharedClock, SystemClock},
    events::{EventBus, EventHandlers, EventHooks},
    webhooks::{signer::SIGNATURE_HEADER, WebhookDispatcher},
    OrderFlowApi,
    PolicyApi,
    SqliteDatabase,
    WebhookApi,
};
use log::*;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    auth::TokenVerifier,
    config::{ServerConfig, TlsConfig},
    errors::ServerError,
    hub::{ConnectionHub, HubHandle},
    middleware::{HmacMiddlewareFactory, JwtMiddlewareFactory},
    routes::{
        health,
        ActivePolicyRoute,
        AddTipRoute,
        AssignDeliveryRoute,
        CancelOrderRoute,
        CancellationAnalyticsRoute,
        ChefAcceptRoute,
        ChefDeclineRoute,
        CountdownStatusRoute,
        CreateWebhookRoute,
        DeleteWebhookRoute,
        EventCatalogueRoute,
        HubStatsRoute,
        MyWebhooksRoute,
        OrderByIdRoute,
        OrderTimelineRoute,
        OrderTipsRoute,
        PaymentCallbackRoute,
        PlaceOrderRoute,
        ReplacePolicyRoute,
        RetryDeliveryRoute,
        TestWebhookRoute,
        UpdateStatusRoute,
        UpdateWebhookRoute,
        WebhookByIdRoute,
        WebhookDeliveriesRoute,
    },
    workers::{start_countdown_ticker, start_dispatch_pool, start_retry_sweeper, BackgroundWorkers},
    ws::{ws_connect, ShutdownSignal, WsSettings},
};

const MAX_DB_CONNECTIONS: u32 = 25;
/// The longest the countdown ticker sleeps when no deadline is pending.
const TICKER_MAX_IDLE: Duration = Duration::from_secs(1);

/// Everything the HTTP workers share, plus the background workers that must be stopped on shutdown.
pub struct Services {
    pub orders: OrderFlowApi<SqliteDatabase>,
    pub policies: PolicyApi<SqliteDatabase>,
    pub webhooks: WebhookApi<SqliteDatabase>,
    pub hub: HubHandle,
    pub verifier: TokenVerifier,
    pub shutdown: ShutdownSignal,
    workers: BackgroundWorkers,
}

pub async fn run_server(config: ServerConfig) -> Result<(), ServerError> {
    let tls = config.tls.as_ref().map(load_tls).transpose()?;
    let db = SqliteDatabase::new_with_deadline(&config.database_url, MAX_DB_CONNECTIONS, config.db_timeout)
        .await
        .map_err(|e| ServerError::StoreConnectError(e.to_string()))?;
    db.migrate().await.map_err(|e| ServerError::StoreConnectError(format!("Migrations failed. {e}")))?;
    let services = start_services(&config, db.clone()).await?;
    let srv = create_server_instance(&config, &services, tls)?;
    actix_web::rt::spawn(watch_signals(srv.handle(), services.shutdown.0.clone()));
    info!("💻️ Listening on {}{}", config.http_addr, if config.tls.is_some() { " (TLS)" } else { "" });
    let result = srv.await;
    info!("💻️ HTTP server stopped. Draining background workers");
    stop_services(services, config.shutdown_grace).await;
    db.close().await;
    result.map_err(ServerError::from)
}

/// Wires the engine together: the event bus and its hooks, the webhook dispatcher, the connection hub, the APIs and the
/// background workers. Countdowns left open by a previous run are recovered before anything else happens.
pub async fn start_services(config: &ServerConfig, db: SqliteDatabase) -> Result<Services, ServerError> {
    let clock: SharedClock = Arc::new(SystemClock);
    let policies = PolicyApi::new(db.clone(), clock.clone());
    let policy = policies.ensure_active_policy(config.seed_policy.clone()).await?;
    info!("🔄️ Active cancellation policy #{}: {}", policy.id, policy.description);

    let vault = config.webhooks.vault()?;
    let dispatcher = WebhookDispatcher::new(db.clone(), vault, clock.clone(), config.webhooks.timeout)?;
    let hub = ConnectionHub::start();
    let mut hooks = EventHooks::default();
    hub.add_to_hooks(&mut hooks);
    let handlers = EventHandlers::new(config.dispatch_queue_size, hooks);
    let (queue_tx, queue_rx) = mpsc::channel(config.dispatch_queue_size);
    let bus = EventBus::new(db.clone(), handlers.producers()).with_dispatch_queue(queue_tx);
    handlers.start_handlers().await;

    let orders = OrderFlowApi::new(db.clone(), bus.clone(), clock.clone(), config.flow);
    let webhooks = WebhookApi::new(db, bus, dispatcher.clone(), clock, config.webhooks.defaults);
    let recovered = orders.recover_countdowns().await?;
    info!("⏳️ {recovered} open countdowns recovered");

    let shutdown = ShutdownSignal::default();
    let token = shutdown.0.clone();
    let mut workers = BackgroundWorkers::new();
    workers.add(start_countdown_ticker(orders.clone(), TICKER_MAX_IDLE, token.clone()));
    for handle in start_dispatch_pool(dispatcher.clone(), queue_rx, config.webhooks.workers, token.clone()) {
        workers.add(handle);
    }
    workers.add(start_retry_sweeper(dispatcher, config.webhooks.sweep_interval, token));
    debug!("💻️ {} background workers running", workers.len());
    Ok(Services { orders, policies, webhooks, hub, verifier: TokenVerifier::new(&config.auth), shutdown, workers })
}

/// Stops the background workers, giving them `grace` to drain the dispatch queue, then stops the hub.
pub async fn stop_services(services: Services, grace: Duration) {
    services.shutdown.0.cancel();
    if tokio::time::timeout(grace, services.workers.join()).await.is_err() {
        warn!("💻️ Background workers did not stop within {}s. Pending deliveries will be retried on restart", grace.as_secs());
    }
    services.hub.shutdown().await;
}

pub fn create_server_instance(
    config: &ServerConfig,
    services: &Services,
    tls: Option<rustls::ServerConfig>,
) -> Result<Server, ServerError> {
    let orders = web::Data::new(services.orders.clone());
    let policies = web::Data::new(services.policies.clone());
    let webhooks = web::Data::new(services.webhooks.clone());
    let hub = web::Data::new(services.hub.clone());
    let verifier = web::Data::new(services.verifier.clone());
    let shutdown = web::Data::new(services.shutdown.clone());
    let ws_settings = web::Data::new(WsSettings { buffer_size: config.ws_buffer_size, ..Default::default() });
    let callback_secret = config.payment_callback_secret.clone();
    let request_timeout = config.request_timeout;
    let server = HttpServer::new(move || {
        let app = App::new()
            .wrap_fn(move |req, srv| {
                let fut = srv.call(req);
                async move {
                    match tokio::time::timeout(request_timeout, fut).await {
                        Ok(res) => res,
                        Err(_) => {
                            warn!("💻️ Request exceeded its {}s deadline", request_timeout.as_secs());
                            Err(ServerError::StoreUnavailable("The request did not complete in time.".into()).into())
                        },
                    }
                }
            })
            .wrap(Logger::new("%t (%D ms) %s %a %{Host}i %r").log_target("homechef::access_log"))
            .app_data(web::JsonConfig::default().error_handler(json_error))
            .app_data(web::PathConfig::default().error_handler(path_error))
            .app_data(web::QueryConfig::default().error_handler(query_error))
            .app_data(orders.clone())
            .app_data(policies.clone())
            .app_data(webhooks.clone())
            .app_data(hub.clone())
            .app_data(verifier.clone())
            .app_data(shutdown.clone())
            .app_data(ws_settings.clone());
        // The catalogue must be registered before `/webhooks/{id}`
        let auth_scope = web::scope("")
            .wrap(JwtMiddlewareFactory::new(verifier.get_ref().clone()))
            .service(PlaceOrderRoute::<SqliteDatabase>::new())
            .service(OrderByIdRoute::<SqliteDatabase>::new())
            .service(OrderTimelineRoute::<SqliteDatabase>::new())
            .service(CountdownStatusRoute::<SqliteDatabase>::new())
            .service(CancelOrderRoute::<SqliteDatabase>::new())
            .service(ChefAcceptRoute::<SqliteDatabase>::new())
            .service(ChefDeclineRoute::<SqliteDatabase>::new())
            .service(UpdateStatusRoute::<SqliteDatabase>::new())
            .service(AssignDeliveryRoute::<SqliteDatabase>::new())
            .service(AddTipRoute::<SqliteDatabase>::new())
            .service(OrderTipsRoute::<SqliteDatabase>::new())
            .service(ActivePolicyRoute::<SqliteDatabase>::new())
            .service(ReplacePolicyRoute::<SqliteDatabase>::new())
            .service(CancellationAnalyticsRoute::<SqliteDatabase>::new())
            .service(EventCatalogueRoute::<SqliteDatabase>::new())
            .service(CreateWebhookRoute::<SqliteDatabase>::new())
            .service(MyWebhooksRoute::<SqliteDatabase>::new())
            .service(WebhookByIdRoute::<SqliteDatabase>::new())
            .service(UpdateWebhookRoute::<SqliteDatabase>::new())
            .service(DeleteWebhookRoute::<SqliteDatabase>::new())
            .service(TestWebhookRoute::<SqliteDatabase>::new())
            .service(WebhookDeliveriesRoute::<SqliteDatabase>::new())
            .service(RetryDeliveryRoute::<SqliteDatabase>::new())
            .service(HubStatsRoute::new());
        let payments_scope = web::scope("/payments")
            .wrap(HmacMiddlewareFactory::new(SIGNATURE_HEADER, callback_secret.clone()))
            .service(PaymentCallbackRoute::<SqliteDatabase>::new());
        // Public routes go first: the authenticated scope matches every path
        app.service(health)
            .route("/ws", web::get().to(ws_connect))
            .service(payments_scope)
            .service(auth_scope)
    })
    .keep_alive(KeepAlive::Timeout(Duration::from_secs(75)))
    .shutdown_timeout(config.shutdown_grace.as_secs())
    .disable_signals();
    let server = match tls {
        Some(tls) => server.bind_rustls_0_23(config.http_addr, tls)?,
        None => server.bind(config.http_addr)?,
    };
    Ok(server.run())
}

fn json_error(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    ServerError::invalid_request(format!("Invalid JSON body. {err}")).into()
}

fn path_error(err: PathError, _req: &HttpRequest) -> actix_web::Error {
    ServerError::NotFound(format!("No such resource. {err}")).into()
}

fn query_error(err: QueryPayloadError, _req: &HttpRequest) -> actix_web::Error {
    ServerError::invalid_request(format!("Invalid query string. {err}")).into()
}

/// Waits for Ctrl-C or SIGTERM. WebSocket sessions are told to close (1001) before the server stops accepting
/// connections and drains in-flight requests.
async fn watch_signals(handle: ServerHandle, shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            },
            Err(e) => {
                warn!("💻️ Cannot listen for SIGTERM. {e}");
                std::future::pending::<()>().await
            },
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("💻️ Ctrl-C received. Shutting down"),
        _ = terminate => info!("💻️ SIGTERM received. Shutting down"),
        _ = shutdown.cancelled() => {},
    }
    shutdown.cancel();
    handle.stop(true).await;
}

fn load_tls(tls: &TlsConfig) -> Result<rustls::ServerConfig, ServerError> {
    let certs = rustls_pemfile::certs(&mut open_pem(&tls.cert_path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_error(&tls.cert_path, e))?;
    if certs.is_empty() {
        return Err(tls_error(&tls.cert_path, "no certificates found"));
    }
    let key = rustls_pemfile::private_key(&mut open_pem(&tls.key_path)?)
        .map_err(|e| tls_error(&tls.key_path, e))?
        .ok_or_else(|| tls_error(&tls.key_path, "no private key found"))?;
    let config = rustls::ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| ServerError::ConfigurationError(format!("TLS setup failed. {e}")))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::ConfigurationError(format!("TLS certificate and key do not match. {e}")))?;
    info!("🔐️ TLS enabled with certificate {}", tls.cert_path.display());
    Ok(config)
}

fn open_pem(path: &Path) -> Result<BufReader<File>, ServerError> {
    File::open(path).map(BufReader::new).map_err(|e| tls_error(path, e))
}

fn tls_error<E: std::fmt::Display>(path: &Path, e: E) -> ServerError {
    ServerError::ConfigurationError(format!("Cannot load {}. {e}", path.display()))
}
