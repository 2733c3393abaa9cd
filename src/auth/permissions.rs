//! Roles and the single role -> permission table.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
  SuperAdmin,
  Admin,
  #[default]
  Readonly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
  ViewDashboard,
  ViewMembers,
  CreateMember,
  EditMember,
  DeleteMember,
  ImportMembers,
  ViewEvents,
  ManageEvents,
  ViewPledges,
  ManagePledges,
  ViewReports,
  ExportData,
  ManageUsers,
  ManageSettings,
}

const READONLY_PERMISSIONS: &[Permission] = &[
  Permission::ViewDashboard,
  Permission::ViewMembers,
  Permission::ViewEvents,
  Permission::ViewPledges,
  Permission::ViewReports,
];

const ADMIN_PERMISSIONS: &[Permission] = &[
  Permission::ViewDashboard,
  Permission::ViewMembers,
  Permission::CreateMember,
  Permission::EditMember,
  Permission::DeleteMember,
  Permission::ImportMembers,
  Permission::ViewEvents,
  Permission::ManageEvents,
  Permission::ViewPledges,
  Permission::ManagePledges,
  Permission::ViewReports,
  Permission::ExportData,
];

impl Permission {
  pub const ALL: &'static [Permission] = &[
    Permission::ViewDashboard,
    Permission::ViewMembers,
    Permission::CreateMember,
    Permission::EditMember,
    Permission::DeleteMember,
    Permission::ImportMembers,
    Permission::ViewEvents,
    Permission::ManageEvents,
    Permission::ViewPledges,
    Permission::ManagePledges,
    Permission::ViewReports,
    Permission::ExportData,
    Permission::ManageUsers,
    Permission::ManageSettings,
  ];

  pub fn as_str(self) -> &'static str {
    match self {
      Permission::ViewDashboard => "view_dashboard",
      Permission::ViewMembers => "view_members",
      Permission::CreateMember => "create_member",
      Permission::EditMember => "edit_member",
      Permission::DeleteMember => "delete_member",
      Permission::ImportMembers => "import_members",
      Permission::ViewEvents => "view_events",
      Permission::ManageEvents => "manage_events",
      Permission::ViewPledges => "view_pledges",
      Permission::ManagePledges => "manage_pledges",
      Permission::ViewReports => "view_reports",
      Permission::ExportData => "export_data",
      Permission::ManageUsers => "manage_users",
      Permission::ManageSettings => "manage_settings",
    }
  }
}

impl fmt::Display for Permission {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl Role {
  /// The authoritative permission set for this role.
  pub fn permissions(self) -> &'static [Permission] {
    match self {
      Role::SuperAdmin => Permission::ALL,
      Role::Admin => ADMIN_PERMISSIONS,
      Role::Readonly => READONLY_PERMISSIONS,
    }
  }

  pub fn has(self, permission: Permission) -> bool {
    self.permissions().contains(&permission)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Role::SuperAdmin => "super_admin",
      Role::Admin => "admin",
      Role::Readonly => "readonly",
    }
  }
}

impl fmt::Display for Role {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Role {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().replace('-', "_").as_str() {
      "super_admin" | "superadmin" => Ok(Role::SuperAdmin),
      "admin" => Ok(Role::Admin),
      "readonly" | "read_only" => Ok(Role::Readonly),
      other => Err(format!("Unknown role: {}", other)),
    }
  }
}

/// Unknown or missing roles get the least privileged role.
impl<'de> Deserialize<'de> for Role {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|s| s.parse().ok()).unwrap_or_default())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_super_admin_has_everything() {
    for p in Permission::ALL {
      assert!(Role::SuperAdmin.has(*p), "super_admin missing {}", p);
    }
  }

  #[test]
  fn test_admin_cannot_manage_users() {
    assert!(Role::Admin.has(Permission::ImportMembers));
    assert!(!Role::Admin.has(Permission::ManageUsers));
    assert!(!Role::Admin.has(Permission::ManageSettings));
  }

  #[test]
  fn test_readonly_only_views() {
    assert!(Role::Readonly.has(Permission::ViewPledges));
    assert!(!Role::Readonly.has(Permission::CreateMember));
    assert!(!Role::Readonly.has(Permission::ManageEvents));
  }

  #[test]
  fn test_role_parsing() {
    assert_eq!("super-admin".parse::<Role>().unwrap(), Role::SuperAdmin);
    assert_eq!("Admin".parse::<Role>().unwrap(), Role::Admin);
    assert!("pastor".parse::<Role>().is_err());

    let role: Role = serde_json::from_str(r#""pastor""#).unwrap();
    assert_eq!(role, Role::Readonly);
    let role: Role = serde_json::from_str("null").unwrap();
    assert_eq!(role, Role::Readonly);
    assert_eq!(serde_json::to_string(&Role::SuperAdmin).unwrap(), r#""super_admin""#);
  }
}
