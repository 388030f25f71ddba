//! Stale-while-revalidate for everything else.

use std::sync::Arc;

use finsync_common::FinSyncError;
use finsync_net::{Request, Response};
use http::Method;
use tracing::{debug, warn};

use super::Strategies;

impl Strategies {
    /// Answer from any cache if possible while refreshing the dynamic cache
    /// from the network in the background.
    pub async fn revalidate(&self, request: &Request) -> Response {
        let network = {
            let fetcher = Arc::clone(&self.fetcher);
            let caches = self.caches.clone();
            let bucket_name = self.config.caches.dynamic_bucket.clone();
            let request = request.clone();

            tokio::spawn(async move {
                match fetcher.fetch(&request).await {
                    Ok(response) => {
                        if response.ok() && request.method == Method::GET {
                            let fresh = response.clone();
                            tokio::spawn(async move {
                                let bucket = caches.open(&bucket_name).await;
                                if let Err(e) = bucket.put(&request, &fresh).await {
                                    warn!(url = %request.url, error = %e, "Revalidation not stored");
                                }
                            });
                        }
                        Some(response)
                    }
                    Err(e) => {
                        debug!(url = %request.url, error = %e, "Revalidation fetch failed");
                        None
                    }
                }
            })
        };

        if let Some(hit) = self.caches.match_any(request).await {
            // The refresh keeps running detached.
            return hit;
        }

        match network.await {
            Ok(Some(response)) => response,
            Ok(None) => Response::network_error(),
            Err(e) => {
                let err = FinSyncError::internal(format!("revalidation task: {}", e));
                warn!(url = %request.url, category = err.category(), error = %err, "Revalidation task failed");
                Response::network_error()
            }
        }
    }
}
