//! Domain records exchanged with the backend.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::auth::Role;

// ============================================================================
// Users
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
  pub id: u64,
  pub email: String,
  #[serde(default)]
  pub first_name: String,
  #[serde(default)]
  pub last_name: String,
  #[serde(default)]
  pub role: Role,
}

impl User {
  pub fn display_name(&self) -> String {
    let full = format!("{} {}", self.first_name, self.last_name);
    let full = full.trim();
    if full.is_empty() {
      self.email.clone()
    } else {
      full.to_string()
    }
  }
}

// ============================================================================
// Members
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Member {
  pub id: u64,
  #[serde(default)]
  pub first_name: String,
  #[serde(default)]
  pub last_name: String,
  #[serde(default)]
  pub email: Option<String>,
  #[serde(default)]
  pub phone: Option<String>,
  #[serde(default)]
  pub status: String,
  #[serde(default)]
  pub date_joined: Option<NaiveDate>,
  #[serde(default)]
  pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewMember {
  pub first_name: String,
  pub last_name: String,
  pub email: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub phone: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub date_of_birth: Option<NaiveDate>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub address: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemberStats {
  pub total_members: u64,
  pub active_members: u64,
  pub inactive_members: u64,
  pub new_members_this_month: u64,
  pub new_members_last_month: u64,
}

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
  pub id: u64,
  #[serde(default)]
  pub title: String,
  #[serde(default)]
  pub description: Option<String>,
  #[serde(default)]
  pub start_datetime: Option<DateTime<Utc>>,
  #[serde(default)]
  pub end_datetime: Option<DateTime<Utc>>,
  #[serde(default)]
  pub location: Option<String>,
  #[serde(default)]
  pub status: String,
  #[serde(default)]
  pub is_public: bool,
  #[serde(default)]
  pub registration_count: u64,
  #[serde(default)]
  pub max_capacity: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
  pub title: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  pub start_datetime: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub end_datetime: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub location: Option<String>,
  pub status: String,
  pub is_public: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub max_capacity: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventStats {
  pub total_events: u64,
  pub upcoming_events: u64,
  pub published_events: u64,
  pub total_registrations: u64,
  pub total_capacity: u64,
}

// ============================================================================
// Pledges
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pledge {
  pub id: u64,
  #[serde(default)]
  pub member: Option<u64>,
  #[serde(default)]
  pub member_name: Option<String>,
  #[serde(default, deserialize_with = "amount")]
  pub amount: f64,
  #[serde(default)]
  pub frequency: String,
  #[serde(default)]
  pub status: String,
  #[serde(default, deserialize_with = "amount")]
  pub total_paid: f64,
  #[serde(default)]
  pub start_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewPledge {
  pub member: u64,
  pub amount: f64,
  pub frequency: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub start_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PledgeStats {
  pub total_pledges: u64,
  pub active_pledges: u64,
  #[serde(deserialize_with = "amount")]
  pub total_pledged_amount: f64,
  #[serde(deserialize_with = "amount")]
  pub total_received_amount: f64,
  #[serde(deserialize_with = "amount")]
  pub average_pledge_amount: f64,
}

/// Monetary values arrive as numbers or as decimal strings ("150.00").
fn amount<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
  D: Deserializer<'de>,
{
  #[derive(Deserialize)]
  #[serde(untagged)]
  enum Raw {
    Number(f64),
    Text(String),
  }

  match Option::<Raw>::deserialize(deserializer)? {
    Some(Raw::Number(n)) => Ok(n),
    Some(Raw::Text(s)) if s.trim().is_empty() => Ok(0.0),
    Some(Raw::Text(s)) => s
      .trim()
      .parse()
      .map_err(|_| serde::de::Error::custom(format!("invalid amount: {}", s))),
    None => Ok(0.0),
  }
}

// ============================================================================
// List responses
// ============================================================================

/// A list response. The backend returns either a bare array or a paginated
/// envelope; both decode into this shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
  pub results: Vec<T>,
  pub count: u64,
  pub next: Option<String>,
  pub previous: Option<String>,
}

impl<T> Default for Page<T> {
  fn default() -> Self {
    Self {
      results: Vec::new(),
      count: 0,
      next: None,
      previous: None,
    }
  }
}

impl<T> Page<T> {
  pub fn has_next(&self) -> bool {
    self.next.is_some()
  }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListBody<T> {
  Envelope {
    results: Vec<T>,
    #[serde(default)]
    count: Option<u64>,
    #[serde(default)]
    next: Option<String>,
    #[serde(default)]
    previous: Option<String>,
  },
  Bare(Vec<T>),
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Page<T> {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    Ok(match ListBody::<T>::deserialize(deserializer)? {
      ListBody::Envelope {
        results,
        count,
        next,
        previous,
      } => Page {
        count: count.unwrap_or(results.len() as u64),
        results,
        next,
        previous,
      },
      ListBody::Bare(results) => Page {
        count: results.len() as u64,
        results,
        next: None,
        previous: None,
      },
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_page_from_envelope() {
    let page: Page<Member> = serde_json::from_value(json!({
      "count": 42,
      "next": "http://localhost:8000/api/v1/members/?page=2",
      "previous": null,
      "results": [{"id": 1, "first_name": "Ruth"}, {"id": 2, "first_name": "Boaz"}]
    }))
    .unwrap();
    assert_eq!(page.count, 42);
    assert_eq!(page.results.len(), 2);
    assert!(page.has_next());
  }

  #[test]
  fn test_page_from_bare_array() {
    let page: Page<Member> =
      serde_json::from_value(json!([{"id": 1}, {"id": 2}, {"id": 3}])).unwrap();
    assert_eq!(page.count, 3);
    assert!(!page.has_next());
  }

  #[test]
  fn test_amounts_accept_strings_and_numbers() {
    let pledge: Pledge = serde_json::from_value(json!({
      "id": 9, "amount": "150.50", "total_paid": 75, "frequency": "monthly"
    }))
    .unwrap();
    assert_eq!(pledge.amount, 150.5);
    assert_eq!(pledge.total_paid, 75.0);

    let stats: PledgeStats = serde_json::from_value(json!({
      "total_pledges": 3, "total_pledged_amount": null
    }))
    .unwrap();
    assert_eq!(stats.total_pledged_amount, 0.0);
    assert_eq!(stats.total_received_amount, 0.0);
  }

  #[test]
  fn test_user_role_defaults() {
    let user: User = serde_json::from_value(json!({"id": 1, "email": "a@b.org"})).unwrap();
    assert_eq!(user.role, Role::Readonly);
    assert_eq!(user.display_name(), "a@b.org");
  }
}
