//! Network-first for `/api/`, falling back to the api cache, the local
//! store and finally the offline queue.

use finsync_net::{Request, Response, ResponseSource};
use finsync_store::LocalRecord;
use http::Method;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, warn};

use super::Strategies;

impl Strategies {
    /// Handle an API request.
    pub async fn api(&self, request: &Request) -> Response {
        match self.fetcher.fetch(request).await {
            Ok(response) if response.ok() => {
                if request.method == Method::GET {
                    self.remember_api(request, &response).await;
                }
                return response;
            }
            Ok(response) => {
                debug!(url = %request.url, status = response.status, "API error status; using offline fallback");
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "API unreachable; using offline fallback");
            }
        }

        self.api_offline(request).await
    }

    /// Keep a successful GET in the api cache and as a local snapshot.
    async fn remember_api(&self, request: &Request, response: &Response) {
        let bucket = self.bucket(&self.config.caches.api_bucket).await;
        self.remember(&bucket, request, response).await;

        let data: JsonValue = match response.json_body() {
            Ok(data) => data,
            Err(e) => {
                debug!(url = %request.url, error = %e, "API response is not JSON; no snapshot");
                return;
            }
        };

        let record = LocalRecord::capture(request.path(), data);
        let saved = match self.database.open().await {
            Ok(store) => store.save_snapshot(&record).await,
            Err(e) => Err(e),
        };
        if let Err(e) = saved {
            warn!(path = %record.id, error = %e, "Snapshot not saved");
        }
    }

    async fn api_offline(&self, request: &Request) -> Response {
        if request.method == Method::GET {
            let bucket = self.bucket(&self.config.caches.api_bucket).await;
            if let Some(hit) = bucket.match_request(request).await {
                debug!(url = %request.url, "Serving API response from cache");
                return self.offline_copy(hit, ResponseSource::Cache);
            }

            if let Some(record) = self.load_snapshot(request.path()).await {
                debug!(path = %record.id, captured = record.timestamp, "Serving API response from local store");
                let response = Response::json(200, &record.data);
                return self.offline_copy(response, ResponseSource::LocalStore);
            }
        } else if request.is_mutation() {
            match self.sync.enqueue(request).await {
                Ok(_) => {
                    return Response::json(
                        202,
                        &json!({ "message": self.config.messages.queued, "offline": true }),
                    );
                }
                Err(e) => {
                    warn!(url = %request.url, method = %request.method, error = %e, "Could not queue offline mutation");
                }
            }
        }

        Response::json(
            503,
            &json!({ "error": self.config.messages.unavailable, "offline": true }),
        )
    }

    async fn load_snapshot(&self, path: &str) -> Option<LocalRecord> {
        let found = match self.database.open().await {
            Ok(store) => store.snapshot(path).await,
            Err(e) => Err(e),
        };
        found.unwrap_or_else(|e| {
            warn!(path, error = %e, "Local store read failed");
            None
        })
    }
}
