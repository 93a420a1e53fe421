//! realmwatch-api: REST API for Realmwatch.
//!
//! Every route delegates to one operation of the [`Scheduler`] control
//! surface and wraps the result in a `{success, data, error}` envelope.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/realms` | List registered realms |
//! | POST | `/api/v1/realms` | Register a realm |
//! | GET | `/api/v1/realms/{principal}` | Get a realm's config |
//! | PUT | `/api/v1/realms/{principal}` | Update a realm's config |
//! | DELETE | `/api/v1/realms/{principal}` | Unregister a realm (records are kept) |
//! | POST | `/api/v1/realms/{principal}/enable` | Resume scheduling |
//! | POST | `/api/v1/realms/{principal}/disable` | Pause scheduling |
//! | GET | `/api/v1/realms/{principal}/status` | Last good record and last error |
//! | GET | `/api/v1/realms/{principal}/latest` | Latest record |
//! | GET | `/api/v1/realms/{principal}/history` | Records, newest first (`limit`, `before`) |
//! | POST | `/api/v1/realms/{principal}/fetch` | Fetch now and return the record (`network`) |
//! | POST | `/api/v1/realms/{principal}/fetch-now` | Make the realm due immediately |
//! | POST | `/api/v1/batch-fetch` | Fetch several realms in parallel |
//! | GET | `/api/v1/summary` | Latest record per realm, best score first |
//! | GET | `/api/v1/scheduler` | Scheduler status |
//! | POST | `/api/v1/scheduler/start` | Start launching fetch cycles |
//! | POST | `/api/v1/scheduler/stop` | Stop launching fetch cycles |
//! | GET | `/healthz` | Liveness |

pub mod handlers;

use axum::Router;
use axum::routing::{get, post};
use realmwatch_scheduler::Scheduler;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Scheduler,
}

/// Build the complete API router.
pub fn build_router(scheduler: Scheduler) -> Router {
    let api_state = ApiState { scheduler };

    let api_routes = Router::new()
        .route("/realms", get(handlers::list_realms).post(handlers::add_realm))
        .route(
            "/realms/{principal}",
            get(handlers::get_realm)
                .put(handlers::update_realm)
                .delete(handlers::remove_realm),
        )
        .route("/realms/{principal}/enable", post(handlers::enable_realm))
        .route("/realms/{principal}/disable", post(handlers::disable_realm))
        .route("/realms/{principal}/status", get(handlers::realm_status))
        .route("/realms/{principal}/latest", get(handlers::latest))
        .route("/realms/{principal}/history", get(handlers::history))
        .route("/realms/{principal}/fetch", post(handlers::fetch))
        .route("/realms/{principal}/fetch-now", post(handlers::fetch_now))
        .route("/batch-fetch", post(handlers::batch_fetch))
        .route("/summary", get(handlers::summary))
        .route("/scheduler", get(handlers::scheduler_status))
        .route("/scheduler/start", post(handlers::start_scheduler))
        .route("/scheduler/stop", post(handlers::stop_scheduler))
        .with_state(api_state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
}
