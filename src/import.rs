//! Bulk member import from CSV.

use chrono::NaiveDate;
use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::io::Read;
use tracing::{info, warn};

use crate::api::types::NewMember;
use crate::api::{ApiError, ApiResult, FlockApi};
use crate::auth::{is_valid_email, Permission};

/// One parsed CSV record, or why it could not be read.
pub type ImportRow = std::result::Result<NewMember, String>;

#[derive(Debug, Deserialize)]
struct CsvMember {
  first_name: Option<String>,
  last_name: Option<String>,
  email: Option<String>,
  #[serde(default)]
  phone: Option<String>,
  #[serde(default)]
  date_of_birth: Option<String>,
  #[serde(default)]
  address: Option<String>,
  #[serde(default)]
  status: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
  value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl CsvMember {
  fn into_member(self) -> ImportRow {
    let date_of_birth = match non_empty(self.date_of_birth) {
      Some(raw) => Some(
        NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
          .map_err(|_| format!("Invalid date of birth '{}', expected YYYY-MM-DD", raw))?,
      ),
      None => None,
    };

    Ok(NewMember {
      first_name: non_empty(self.first_name).unwrap_or_default(),
      last_name: non_empty(self.last_name).unwrap_or_default(),
      email: non_empty(self.email).unwrap_or_default(),
      phone: non_empty(self.phone),
      date_of_birth,
      address: non_empty(self.address),
      status: non_empty(self.status),
    })
  }
}

/// Read members from CSV with a header row. Unknown columns are ignored.
pub fn parse_members<R: Read>(reader: R) -> Result<Vec<ImportRow>> {
  let mut reader = csv::ReaderBuilder::new()
    .trim(csv::Trim::All)
    .flexible(true)
    .from_reader(reader);

  let headers = reader
    .headers()
    .map_err(|e| eyre!("Failed to read CSV header: {}", e))?;
  for required in ["first_name", "last_name", "email"] {
    if !headers.iter().any(|h| h == required) {
      return Err(eyre!("CSV is missing the '{}' column", required));
    }
  }

  Ok(
    reader
      .deserialize::<CsvMember>()
      .map(|record| match record {
        Ok(member) => member.into_member(),
        Err(e) => Err(format!("Unreadable row: {}", e)),
      })
      .collect(),
  )
}

/// Client-side checks run before a row is sent.
pub fn validate_member(member: &NewMember) -> std::result::Result<(), String> {
  if member.first_name.is_empty() {
    return Err("First name is required".to_string());
  }
  if member.last_name.is_empty() {
    return Err("Last name is required".to_string());
  }
  if member.email.is_empty() {
    return Err("Email is required".to_string());
  }
  if !is_valid_email(&member.email) {
    return Err(format!("Invalid email address '{}'", member.email));
  }
  Ok(())
}

/// Server rejections keep the server's detail so rows can be told apart.
fn row_message(error: ApiError) -> String {
  match error.cause {
    Some(detail) => format!("{} {}", error.message, detail),
    None => error.message,
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowError {
  /// Line in the file: data index plus the header offset
  pub row: usize,
  pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportReport {
  pub total: usize,
  pub successful: usize,
  pub failed: usize,
  /// Size of each processed batch
  pub batches: Vec<usize>,
  pub errors: Vec<RowError>,
}

/// Create members batch by batch. Rows of a batch are sent together; the next
/// batch starts once the previous one settled.
pub async fn import_members(
  api: &FlockApi,
  rows: Vec<ImportRow>,
  batch_size: usize,
) -> ApiResult<ImportReport> {
  if !api.auth().has_permission(Permission::ImportMembers) {
    return Err(ApiError::permission_denied());
  }

  let batch_size = batch_size.max(1);
  let mut report = ImportReport {
    total: rows.len(),
    ..ImportReport::default()
  };

  let indexed: Vec<(usize, ImportRow)> = rows.into_iter().enumerate().collect();
  for (batch_number, batch) in indexed.chunks(batch_size).enumerate() {
    let outcomes = join_all(batch.iter().map(|(index, row)| async move {
      let result = match row {
        Ok(member) => match validate_member(member) {
          Ok(()) => api.create_member(member).await.map(|_| ()).map_err(row_message),
          Err(e) => Err(e),
        },
        Err(e) => Err(e.clone()),
      };
      (*index, result)
    }))
    .await;

    report.batches.push(batch.len());
    for (index, result) in outcomes {
      match result {
        Ok(()) => report.successful += 1,
        Err(error) => {
          warn!(row = index + 2, %error, "Import row failed");
          report.failed += 1;
          report.errors.push(RowError {
            row: index + 2,
            error,
          });
        }
      }
    }
    info!(
      batch = batch_number + 1,
      size = batch.len(),
      successful = report.successful,
      failed = report.failed,
      "Import batch done"
    );
  }

  Ok(report)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::resources::testing::api_with_role;
  use crate::api::transport::testing::ScriptedBackend;
  use crate::api::ErrorKind;
  use serde_json::json;
  use std::time::Duration;
  use tokio::time::Instant;

  fn twelve_rows() -> String {
    let mut csv = String::from("first_name,last_name,email,phone\n");
    for i in 0..12 {
      match i {
        3 => csv.push_str("Mary,,mary@example.org,\n"),
        8 => csv.push_str("John,Mark,not-an-email,\n"),
        _ => csv.push_str(&format!("Member{},Smith,member{}@example.org,555-010{}\n", i, i, i % 10)),
      }
    }
    csv
  }

  #[tokio::test(start_paused = true)]
  async fn test_twelve_rows_in_three_batches() {
    let backend = ScriptedBackend::new();
    backend.ok("POST members/", json!({"id": 100, "first_name": "Member"}));
    let api = api_with_role(backend.clone(), Some("admin")).await;
    backend.with_delay(Duration::from_millis(100));

    let rows = parse_members(twelve_rows().as_bytes()).unwrap();
    let started = Instant::now();
    let report = import_members(&api, rows, 5).await.unwrap();

    assert_eq!(report.total, 12);
    assert_eq!(report.successful, 10);
    assert_eq!(report.failed, 2);
    assert_eq!(report.batches, vec![5, 5, 2]);
    assert_eq!(
      report.errors.iter().map(|e| e.row).collect::<Vec<_>>(),
      vec![5, 10]
    );
    assert_eq!(report.errors[0].error, "Last name is required");
    assert_eq!(backend.count("POST members/"), 10);
    // Rows of a batch go out together
    assert_eq!(started.elapsed(), Duration::from_millis(300));
  }

  #[tokio::test]
  async fn test_server_rejection_is_a_row_error() {
    let backend = ScriptedBackend::new();
    backend.on(
      "POST members/",
      Ok(crate::api::transport::HttpResponse::new(
        400,
        json!({"email": ["member with this email already exists."]}).to_string(),
      )),
    );
    let api = api_with_role(backend, Some("admin")).await;

    let rows = parse_members("first_name,last_name,email\nAnna,Lee,anna@example.org\n".as_bytes()).unwrap();
    let report = import_members(&api, rows, 5).await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.errors[0].row, 2);
    assert!(report.errors[0]
      .error
      .contains("member with this email already exists."));
  }

  #[tokio::test]
  async fn test_import_requires_permission() {
    let backend = ScriptedBackend::new();
    let api = api_with_role(backend.clone(), Some("readonly")).await;

    let rows = parse_members(twelve_rows().as_bytes()).unwrap();
    let err = import_members(&api, rows, 5).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::PermissionDenied);
    assert_eq!(backend.count("POST members/"), 0);
  }

  #[test]
  fn test_missing_column_rejected() {
    let err = parse_members("first_name,email\nA,a@b.org\n".as_bytes()).unwrap_err();
    assert!(err.to_string().contains("last_name"));
  }

  #[test]
  fn test_bad_date_is_a_row_error() {
    let rows = parse_members(
      "first_name,last_name,email,date_of_birth\nA,B,a@b.org,31/12/1990\nC,D,c@d.org,1990-12-31\n".as_bytes(),
    )
    .unwrap();
    assert!(rows[0].is_err());
    assert_eq!(
      rows[1].as_ref().unwrap().date_of_birth,
      NaiveDate::from_ymd_opt(1990, 12, 31)
    );
  }
}
