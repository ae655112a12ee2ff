use chrono::Utc;
use std::sync::Arc;

use vigil_core::ipc::{VigilRequest, VigilResponse};

use crate::subsystems::pipeline::Pipeline;
use crate::subsystems::query::{ActivityWindow, QueryService};
use crate::subsystems::retention;
use crate::subsystems::run_control::RunController;

/// Everything a request handler can reach.
pub struct AppState {
    pub controller: Arc<RunController>,
    pub pipeline: Arc<Pipeline>,
    pub query: QueryService,
    pub retention_days: i64,
}

pub async fn handle_request(request: VigilRequest, state: &AppState) -> VigilResponse {
    if let VigilRequest::Ping = request {
        return VigilResponse::pong();
    }
    match dispatch(request, state).await {
        Ok(data) => VigilResponse::ok(data),
        Err(e) => VigilResponse::err(e.to_string()),
    }
}

async fn dispatch(request: VigilRequest, state: &AppState) -> anyhow::Result<serde_json::Value> {
    let query = &state.query;
    let value = match request {
        VigilRequest::Ping => serde_json::json!({"pong": true}),
        VigilRequest::Health => {
            let store = state.pipeline.store();
            let detail = store
                .health()
                .await
                .map_err(|e| anyhow::anyhow!("Store health check failed: {}", e))?;
            serde_json::json!({
                "store": store.name(),
                "store_detail": detail,
                "run": state.controller.status(),
                "status": "healthy"
            })
        }
        VigilRequest::StartRun => {
            let pipeline = Arc::clone(&state.pipeline);
            state
                .controller
                .start(move |reporter| async move { pipeline.run(&reporter).await })?;
            tracing::info!("Pipeline run started via IPC");
            serde_json::json!({"started": true})
        }
        VigilRequest::RunStatus => serde_json::to_value(state.controller.status())?,
        VigilRequest::TailLogs { cursor } => serde_json::to_value(state.controller.tail_logs(cursor))?,
        VigilRequest::CancelRun => {
            serde_json::json!({"cancelled": state.controller.cancel()})
        }
        VigilRequest::RetentionSweep { max_age_days } => {
            let days = max_age_days.unwrap_or(state.retention_days);
            let report =
                retention::run_retention_sweep(state.pipeline.store().as_ref(), days, Utc::now())
                    .await?;
            serde_json::to_value(report)?
        }
        VigilRequest::ActiveCountries {
            dates,
            days,
            filters,
        } => {
            let window = ActivityWindow::from_request(dates, days);
            serde_json::to_value(query.active_countries(&window, &filters).await?)?
        }
        VigilRequest::CountryEvents {
            country,
            date,
            filters,
        } => serde_json::to_value(query.country_events(&country, date, &filters).await?)?,
        VigilRequest::LatestCountryEvents { country, filters } => {
            serde_json::to_value(query.latest_country_events(&country, &filters).await?)?
        }
        VigilRequest::NonGeorefEvents { date, filters } => {
            serde_json::to_value(query.non_georef_events(date, &filters).await?)?
        }
        VigilRequest::CountriesActivity { date } => {
            serde_json::to_value(query.countries_activity(date).await?)?
        }
        VigilRequest::Search { query: q } => serde_json::to_value(query.search(&q).await?)?,
        VigilRequest::AvailableDates => serde_json::to_value(query.available_dates().await?)?,
        VigilRequest::Sources => serde_json::to_value(query.sources().await?)?,
        VigilRequest::CountryFacets { country, date } => {
            serde_json::to_value(query.country_facets(&country, date).await?)?
        }
    };
    Ok(value)
}
