//! Principal model.
//!
//! Real deployments front the Kernel with OIDC or mTLS middleware; whatever
//! sits in front must supply a principal with a subject and roles. This
//! module carries the dev extractor: an `X-Kernel-Principal` header of the
//! form `subject:role1,role2`, accepted in development or when
//! `KERNEL_DEV_AUTH=1` is set explicitly.

use kernel_sdk::{config::KernelConfig, error::KernelError};

pub const PRINCIPAL_HEADER: &str = "X-Kernel-Principal";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Admin,
    Operator,
    Auditor,
    Service,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "admin" => Some(Self::Admin),
            "operator" => Some(Self::Operator),
            "auditor" => Some(Self::Auditor),
            "service" => Some(Self::Service),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Principal {
    pub subject: String,
    pub roles: Vec<Role>,
}

impl Principal {
    /// Parse `subject:role1,role2`. Unknown roles are dropped; a principal
    /// with no valid role is rejected.
    pub fn from_header(raw: &str) -> Option<Self> {
        let (subject, roles_raw) = raw.split_once(':')?;
        let subject = subject.trim();
        if subject.is_empty() {
            return None;
        }
        let roles: Vec<Role> = roles_raw.split(',').filter_map(Role::parse).collect();
        if roles.is_empty() {
            return None;
        }
        Some(Self {
            subject: subject.to_string(),
            roles,
        })
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&Role::Admin) || self.roles.contains(&role)
    }
}

/// Authenticate a request from the dev principal header.
pub fn authenticate(
    config: &KernelConfig,
    header: Option<&str>,
) -> Result<Principal, KernelError> {
    if config.env.is_production() && !config.dev_auth {
        // The dev header is not a production credential.
        return Err(KernelError::Unauthenticated);
    }
    header
        .and_then(Principal::from_header)
        .ok_or(KernelError::Unauthenticated)
}

/// Role gate for a route.
pub fn require_role(principal: &Principal, role: Role) -> Result<(), KernelError> {
    if principal.has_role(role) {
        Ok(())
    } else {
        Err(KernelError::Forbidden)
    }
}
