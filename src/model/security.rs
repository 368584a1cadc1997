use std::fmt;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::model::common::{Id, Label};

/// Bit-coded set of permission layers a type enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PermissionMask(pub u8);

impl PermissionMask {
    pub const INSTANCE: u8 = 0x01;
    pub const PROPERTY: u8 = 0x02;
    pub const STEP: u8 = 0x04;
    pub const TYPE: u8 = 0x08;

    pub const NONE: PermissionMask = PermissionMask(0);
    pub const ALL: PermissionMask = PermissionMask(0x0f);

    pub fn encode(type_layer: bool, step: bool, property: bool, instance: bool) -> Self {
        let mut bits = 0;
        if type_layer {
            bits |= Self::TYPE;
        }
        if step {
            bits |= Self::STEP;
        }
        if property {
            bits |= Self::PROPERTY;
        }
        if instance {
            bits |= Self::INSTANCE;
        }
        PermissionMask(bits)
    }

    pub fn uses_type(&self) -> bool {
        self.0 & Self::TYPE != 0
    }

    pub fn uses_step(&self) -> bool {
        self.0 & Self::STEP != 0
    }

    pub fn uses_property(&self) -> bool {
        self.0 & Self::PROPERTY != 0
    }

    pub fn uses_instance(&self) -> bool {
        self.0 & Self::INSTANCE != 0
    }

    pub fn uses_any(&self) -> bool {
        self.0 & Self::ALL.0 != 0
    }
}

impl fmt::Display for PermissionMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (self.uses_type(), "Type"),
            (self.uses_step(), "Step"),
            (self.uses_property(), "Property"),
            (self.uses_instance(), "Instance"),
        ];
        let joined = names
            .iter()
            .filter(|(enabled, _)| *enabled)
            .map(|(_, name)| *name)
            .join(",");
        write!(f, "{}", joined)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Permission {
    Read,
    Edit,
    Create,
    Delete,
    Relate,
    Export,
}

impl Permission {
    fn bit(self) -> u8 {
        match self {
            Permission::Read => 0x01,
            Permission::Edit => 0x02,
            Permission::Create => 0x04,
            Permission::Delete => 0x08,
            Permission::Relate => 0x10,
            Permission::Export => 0x20,
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Permission::Read => "READ",
            Permission::Edit => "EDIT",
            Permission::Create => "CREATE",
            Permission::Delete => "DELETE",
            Permission::Relate => "RELATE",
            Permission::Export => "EXPORT",
        };
        write!(f, "{}", name)
    }
}

/// Set of permissions granted through one ACL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PermissionBits(pub u8);

impl PermissionBits {
    pub const NONE: PermissionBits = PermissionBits(0);
    pub const ALL: PermissionBits = PermissionBits(0x3f);

    pub fn of(permissions: &[Permission]) -> Self {
        PermissionBits(permissions.iter().fold(0, |bits, p| bits | p.bit()))
    }

    pub fn grants(&self, permission: Permission) -> bool {
        self.0 & permission.bit() != 0
    }

    pub fn union(self, other: PermissionBits) -> Self {
        PermissionBits(self.0 | other.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AclCategory {
    Instance,
    Structure,
    Workflow,
    SelectList,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Acl {
    pub id: Id,
    pub name: String,
    pub category: AclCategory,
    #[serde(default)]
    pub label: Label,
}

/// Permissions one caller holds on one ACL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclAssignment {
    pub acl_id: Id,
    pub permissions: PermissionBits,
}

/// Workflow step an instance is in; carries the step-layer ACL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: Id,
    pub name: String,
    pub workflow: Id,
    pub acl: Id,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    StructureManagement,
    WorkflowManagement,
    AclManagement,
}

/// Identity of whoever performs an operation.
pub trait CallerIdentity: Send + Sync {
    fn user_id(&self) -> Id;
    fn is_supervisor(&self) -> bool;
    fn is_running_as_system(&self) -> bool;
    fn is_in_role(&self, role: Role) -> bool;
    fn acl_assignments(&self) -> &[AclAssignment];

    /// Permissions granted on `acl`, merged over all assignments for it
    fn permission(&self, acl: Id) -> PermissionBits {
        self.acl_assignments()
            .iter()
            .filter(|a| a.acl_id == acl)
            .fold(PermissionBits::NONE, |bits, a| bits.union(a.permissions))
    }
}

/// Caller identity with an explicit ACL assignment list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: Id,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default)]
    pub global_supervisor: bool,
    #[serde(default)]
    pub running_as_system: bool,
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(default)]
    pub acl_assignments: Vec<AclAssignment>,
}

pub const SYSTEM_USER_ID: Id = 0;

impl UserContext {
    /// Create a new UserContext with just a user ID
    pub fn new(user_id: Id) -> Self {
        Self {
            user_id,
            user_name: None,
            global_supervisor: false,
            running_as_system: false,
            roles: Vec::new(),
            acl_assignments: Vec::new(),
        }
    }

    /// Create a system context for internal operations; bypasses every check
    pub fn system() -> Self {
        Self {
            user_id: SYSTEM_USER_ID,
            user_name: Some("System".to_string()),
            global_supervisor: false,
            running_as_system: true,
            roles: Vec::new(),
            acl_assignments: Vec::new(),
        }
    }

    /// Create a global supervisor context
    pub fn supervisor(user_id: Id) -> Self {
        Self {
            global_supervisor: true,
            user_name: Some("Supervisor".to_string()),
            ..Self::new(user_id)
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.roles.push(role);
        self
    }

    pub fn grant(mut self, acl_id: Id, permissions: &[Permission]) -> Self {
        self.acl_assignments.push(AclAssignment {
            acl_id,
            permissions: PermissionBits::of(permissions),
        });
        self
    }
}

impl CallerIdentity for UserContext {
    fn user_id(&self) -> Id {
        self.user_id
    }

    fn is_supervisor(&self) -> bool {
        self.global_supervisor
    }

    fn is_running_as_system(&self) -> bool {
        self.running_as_system
    }

    fn is_in_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    fn acl_assignments(&self) -> &[AclAssignment] {
        &self.acl_assignments
    }
}
