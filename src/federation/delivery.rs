//! Activity delivery
//!
//! Signs and POSTs activities to remote inboxes. Delivery is
//! fire-and-forget: failures are returned to the caller, never retried.

use std::sync::Arc;
use std::time::Instant;

use super::activity::{ACTIVITY_JSON, ApObject};
use super::keys::PrivateKeyCache;
use super::signature::sign_request;
use crate::error::AppError;
use crate::metrics::{DELIVERIES_TOTAL, DELIVERY_DURATION_SECONDS};

/// Key id published for an actor's signing key
pub fn key_id_for(actor_url: &str) -> String {
    format!("{}#main-key", actor_url)
}

/// Activity delivery service
#[derive(Clone)]
pub struct SecureDelivery {
    http_client: reqwest::Client,
    keys: Arc<PrivateKeyCache>,
}

impl SecureDelivery {
    pub fn new(http_client: reqwest::Client, keys: Arc<PrivateKeyCache>) -> Self {
        Self { http_client, keys }
    }

    /// Deliver an activity to a single inbox
    ///
    /// # Arguments
    /// * `as_user` - Local user the activity is sent for (logging only)
    /// * `private_key_pem` - The user's signing key
    /// * `inbox_url` - Target inbox URL
    /// * `from_actor_url` - The user's actor URL; the key id is derived from it
    /// * `activity` - Activity to send
    ///
    /// # Errors
    /// `AppError::Delivery` on network failure or a non-2xx answer.
    pub async fn deliver(
        &self,
        as_user: &str,
        private_key_pem: &str,
        inbox_url: &str,
        from_actor_url: &str,
        activity: &ApObject,
    ) -> Result<(), AppError> {
        let activity_type = activity.kind().as_str();
        let started = Instant::now();

        let result = self
            .post_signed(private_key_pem, inbox_url, from_actor_url, activity)
            .await;

        DELIVERY_DURATION_SECONDS
            .with_label_values(&[activity_type])
            .observe(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "success" } else { "failure" };
        DELIVERIES_TOTAL
            .with_label_values(&[activity_type, status])
            .inc();

        if result.is_ok() {
            tracing::info!(
                user = %as_user,
                inbox = %inbox_url,
                activity_type,
                "Delivered activity"
            );
        }
        result
    }

    /// Deliver using the user's cached private key.
    ///
    /// # Errors
    /// `AppError::LocalLookup` when the user has no key, otherwise as
    /// [`SecureDelivery::deliver`].
    pub async fn deliver_as(
        &self,
        as_user: &str,
        inbox_url: &str,
        from_actor_url: &str,
        activity: &ApObject,
    ) -> Result<(), AppError> {
        let private_key_pem = self.keys.get_or_fetch(as_user).await?;
        self.deliver(as_user, &private_key_pem, inbox_url, from_actor_url, activity)
            .await
    }

    async fn post_signed(
        &self,
        private_key_pem: &str,
        inbox_url: &str,
        from_actor_url: &str,
        activity: &ApObject,
    ) -> Result<(), AppError> {
        // 1. Serialize activity
        let body = serde_json::to_vec(activity)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to serialize activity: {}", e)))?;

        // 2. Sign request
        let sig_headers = sign_request(
            "POST",
            inbox_url,
            Some(&body),
            private_key_pem,
            &key_id_for(from_actor_url),
        )?;

        // 3. POST to inbox with signed headers
        let mut request = self
            .http_client
            .post(inbox_url)
            .header("Content-Type", ACTIVITY_JSON)
            .header("Accept", ACTIVITY_JSON)
            .header("Date", sig_headers.date)
            .header("Signature", sig_headers.signature);

        if let Some(digest) = sig_headers.digest {
            request = request.header("Digest", digest);
        }

        let response = request.body(body).send().await.map_err(|e| {
            AppError::Delivery(format!("Failed to deliver to {}: {}", inbox_url, e))
        })?;

        // 4. Handle response
        if !response.status().is_success() {
            return Err(AppError::Delivery(format!(
                "Inbox {} rejected activity: HTTP {}",
                inbox_url,
                response.status()
            )));
        }

        Ok(())
    }
}
