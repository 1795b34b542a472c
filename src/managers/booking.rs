use parking_lot::RwLock;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::BotConfig;
use crate::error::{BotError, Result};

const API_BASE: &str = "https://api.calendly.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const FETCH_ATTEMPTS: u32 = 2;
/// How long a fetched invitee list stays valid. Bookings are checked on
/// human timescales, so staleness up to this bound is fine.
const CACHE_TTL: Duration = Duration::from_secs(600);
/// Upcoming-event window queried per refresh.
const LOOKAHEAD_DAYS: i64 = 30;

#[derive(Debug, Deserialize)]
struct CurrentUserResponse {
    resource: CurrentUser,
}

#[derive(Debug, Deserialize)]
struct CurrentUser {
    uri: String,
}

#[derive(Debug, Deserialize)]
struct ScheduledEventsResponse {
    collection: Vec<ScheduledEvent>,
}

#[derive(Debug, Deserialize)]
struct ScheduledEvent {
    uri: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct InviteesResponse {
    collection: Vec<Invitee>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Invitee {
    pub email: String,
    pub name: String,
    pub status: String,
}

struct CachedInvitees {
    fetched_at: Instant,
    invitees: Vec<Invitee>,
}

impl CachedInvitees {
    fn is_fresh_at(&self, now: Instant) -> bool {
        now.duration_since(self.fetched_at) < CACHE_TTL
    }
}

/// Looks up whether a member booked an onboarding call, against the
/// booking provider's REST API.
///
/// Invitee lists are cached; a cache hit never touches the network.
/// Without a configured API token every check returns `NotConfigured`
/// via `is_configured`, and callers fall back to direct granting.
pub struct BookingChecker {
    config: Arc<BotConfig>,
    client: reqwest::Client,
    cache: RwLock<Option<CachedInvitees>>,
}

impl BookingChecker {
    pub fn new(config: Arc<BotConfig>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            config,
            client,
            cache: RwLock::new(None),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.config.booking_api_token.is_some()
    }

    /// True when an active invitee matches the given email or display
    /// name (case-insensitive).
    pub async fn has_booking(&self, email_or_name: &str) -> Result<bool> {
        let invitees = self.invitees().await?;
        let needle = email_or_name.trim().to_lowercase();
        let found = invitees.iter().any(|i| {
            i.status.eq_ignore_ascii_case("active")
                && (i.email.to_lowercase() == needle || i.name.to_lowercase() == needle)
        });
        if found {
            info!("Found active booking for {}", mask_email(email_or_name));
        } else {
            debug!("No booking found for {}", mask_email(email_or_name));
        }
        Ok(found)
    }

    /// Count of active upcoming invitees, for the stats command.
    pub async fn active_booking_count(&self) -> Result<usize> {
        let invitees = self.invitees().await?;
        Ok(invitees
            .iter()
            .filter(|i| i.status.eq_ignore_ascii_case("active"))
            .count())
    }

    async fn invitees(&self) -> Result<Vec<Invitee>> {
        {
            let cache = self.cache.read();
            if let Some(cached) = cache.as_ref() {
                if cached.is_fresh_at(Instant::now()) {
                    return Ok(cached.invitees.clone());
                }
            }
        }

        let invitees = self.fetch_invitees().await?;
        *self.cache.write() = Some(CachedInvitees {
            fetched_at: Instant::now(),
            invitees: invitees.clone(),
        });
        Ok(invitees)
    }

    async fn fetch_invitees(&self) -> Result<Vec<Invitee>> {
        let token = self
            .config
            .booking_api_token
            .as_deref()
            .ok_or_else(|| BotError::BookingApi {
                message: "no API token configured".to_string(),
            })?;

        let user: CurrentUserResponse = self
            .get_json(&format!("{}/users/me", API_BASE), token, &[])
            .await?;

        let now = chrono::Utc::now();
        let max = now + chrono::Duration::days(LOOKAHEAD_DAYS);
        let events: ScheduledEventsResponse = self
            .get_json(
                &format!("{}/scheduled_events", API_BASE),
                token,
                &[
                    ("user", user.resource.uri.as_str()),
                    ("status", "active"),
                    ("min_start_time", &now.to_rfc3339()),
                    ("max_start_time", &max.to_rfc3339()),
                    ("count", "100"),
                ],
            )
            .await?;

        let mut invitees = Vec::new();
        for event in events
            .collection
            .iter()
            .filter(|e| e.status.eq_ignore_ascii_case("active"))
        {
            let response: InviteesResponse = self
                .get_json(&format!("{}/invitees", event.uri), token, &[("count", "100")])
                .await?;
            invitees.extend(response.collection);
        }

        info!(
            "Refreshed booking cache: {} invitee(s) across {} event(s)",
            invitees.len(),
            events.collection.len()
        );
        Ok(invitees)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        token: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let mut last_err = None;
        for attempt in 1..=FETCH_ATTEMPTS {
            let result = self
                .client
                .get(url)
                .bearer_auth(token)
                .query(query)
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response.json::<T>().await.map_err(|e| BotError::BookingApi {
                            message: format!("invalid response from {}: {}", url, e),
                        });
                    }
                    // Auth and client errors will not improve on retry.
                    if status.is_client_error() {
                        return Err(BotError::BookingApi {
                            message: format!("{} returned {}", url, status),
                        });
                    }
                    last_err = Some(format!("{} returned {}", url, status));
                }
                Err(e) => last_err = Some(e.to_string()),
            }
            if attempt < FETCH_ATTEMPTS {
                warn!("Booking API request to {} failed, retrying", url);
            }
        }
        Err(BotError::BookingApi {
            message: last_err.unwrap_or_else(|| "request failed".to_string()),
        })
    }
}

/// Mask an email address for logs: keep the first character of the local
/// part and the full domain. Non-email inputs keep only their first
/// character.
pub fn mask_email(input: &str) -> String {
    match input.split_once('@') {
        Some((local, domain)) if !local.is_empty() => {
            let first = local.chars().next().unwrap_or('*');
            format!("{}{}@{}", first, "*".repeat(local.chars().count() - 1), domain)
        }
        _ => {
            let mut chars = input.chars();
            match chars.next() {
                Some(first) => format!("{}{}", first, "*".repeat(chars.count())),
                None => String::new(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_email() {
        assert_eq!(mask_email("john.doe@example.com"), "j*******@example.com");
        assert_eq!(mask_email("a@b.io"), "a@b.io");
        assert_eq!(mask_email("someuser"), "s*******");
        assert_eq!(mask_email(""), "");
        // Degenerate address with empty local part.
        assert_eq!(mask_email("@example.com"), "@***********");
    }

    #[test]
    fn test_invitee_response_parses() {
        let raw = r#"{
            "collection": [
                {"email": "a@b.com", "name": "Alice", "status": "active"},
                {"email": "c@d.com", "name": "Carol", "status": "canceled"}
            ]
        }"#;
        let parsed: InviteesResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.collection.len(), 2);
        assert_eq!(parsed.collection[0].name, "Alice");
        assert_eq!(parsed.collection[1].status, "canceled");
    }

    #[test]
    fn test_scheduled_events_response_parses() {
        let raw = r#"{
            "collection": [
                {"uri": "https://api.calendly.com/scheduled_events/XYZ", "status": "active"}
            ]
        }"#;
        let parsed: ScheduledEventsResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.collection.len(), 1);
        assert!(parsed.collection[0].uri.ends_with("/XYZ"));
    }

    #[test]
    fn test_cache_expires_after_ttl() {
        let now = Instant::now();
        let cached = CachedInvitees {
            fetched_at: now,
            invitees: vec![],
        };
        assert!(cached.is_fresh_at(now + Duration::from_secs(599)));
        assert!(!cached.is_fresh_at(now + CACHE_TTL));
    }

    #[test]
    fn test_checker_unconfigured() {
        let checker = BookingChecker::new(Arc::new(BotConfig::default()));
        assert!(!checker.is_configured());
    }
}
