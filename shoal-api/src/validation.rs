///! Input validation for cluster and node requests

use shoal_common::{DeploymentMode, Error, NodeRole};

/// Maximum allowed lengths for various fields
pub const MAX_NAME_LENGTH: usize = 128;
pub const MAX_PATH_LENGTH: usize = 4096;

/// Validation result type
pub type ValidationResult<T> = Result<T, Error>;

/// Cluster name validation; returns the trimmed name
pub fn validate_cluster_name(name: &str) -> ValidationResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::ClusterNameEmpty);
    }

    if name.chars().count() > MAX_NAME_LENGTH {
        return Err(Error::Validation(format!(
            "Cluster name too long (max {} characters)",
            MAX_NAME_LENGTH
        )));
    }

    if name.chars().any(char::is_control) {
        return Err(Error::Validation(
            "Cluster name cannot contain control characters".to_string(),
        ));
    }

    Ok(name.to_string())
}

/// Install path validation; empty means "inherit"
pub fn validate_install_dir(path: &str) -> ValidationResult<()> {
    if path.is_empty() {
        return Ok(());
    }

    if path.len() > MAX_PATH_LENGTH {
        return Err(Error::Validation(format!(
            "Install path too long (max {} characters)",
            MAX_PATH_LENGTH
        )));
    }

    if !path.starts_with('/') {
        return Err(Error::Validation(format!(
            "Install path must be absolute: {}",
            path
        )));
    }

    if path.split('/').any(|segment| segment == "..") {
        return Err(Error::Validation(
            "Install path cannot contain '..'".to_string(),
        ));
    }

    Ok(())
}

/// Port range validation (1-65535)
pub fn validate_port(field: &str, port: u32) -> ValidationResult<u16> {
    if port == 0 || port > u16::MAX as u32 {
        return Err(Error::Validation(format!(
            "{} must be between 1 and 65535, got {}",
            field, port
        )));
    }
    Ok(port as u16)
}

/// Validated node ports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodePorts {
    pub membership: u16,
    pub api: Option<u16>,
    pub worker: Option<u16>,
}

/// Validate node ports and drop the ones that are meaningless for the role.
///
/// The API port only applies to master-capable roles; the secondary worker
/// port only to master-capable roles in hybrid clusters.
pub fn validate_node_ports(
    mode: DeploymentMode,
    role: NodeRole,
    membership: u32,
    api: Option<u32>,
    worker: Option<u32>,
) -> ValidationResult<NodePorts> {
    let membership = validate_port("membership_port", membership)?;
    let api = api.map(|p| validate_port("api_port", p)).transpose()?;
    let worker = worker.map(|p| validate_port("worker_port", p)).transpose()?;

    let api = if role.is_master() { api } else { None };
    let worker = if role.is_master() && mode == DeploymentMode::Hybrid {
        worker
    } else {
        None
    };

    Ok(NodePorts {
        membership,
        api,
        worker,
    })
}

/// Role validation against the owning cluster's mode
pub fn validate_role(mode: DeploymentMode, role: NodeRole) -> ValidationResult<()> {
    if !role.allowed_in(mode) {
        return Err(Error::Validation(format!(
            "Role '{}' is not allowed in a {} cluster",
            role, mode
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_name_validation() {
        assert_eq!(validate_cluster_name("  demo ").unwrap(), "demo");
        assert!(matches!(validate_cluster_name(""), Err(Error::ClusterNameEmpty)));
        assert!(matches!(validate_cluster_name("   "), Err(Error::ClusterNameEmpty)));
        assert!(validate_cluster_name(&"a".repeat(MAX_NAME_LENGTH + 1)).is_err());
        assert!(validate_cluster_name("bad\nname").is_err());
    }

    #[test]
    fn test_install_dir_validation() {
        assert!(validate_install_dir("").is_ok());
        assert!(validate_install_dir("/opt/engine").is_ok());
        assert!(validate_install_dir("opt/engine").is_err());
        assert!(validate_install_dir("/opt/../etc").is_err());
    }

    #[test]
    fn test_port_range() {
        assert_eq!(validate_port("membership_port", 5801).unwrap(), 5801);
        assert!(validate_port("membership_port", 0).is_err());
        assert!(validate_port("membership_port", 65536).is_err());
        assert_eq!(validate_port("membership_port", 65535).unwrap(), 65535);
    }

    #[test]
    fn test_ports_dropped_for_roles_that_do_not_use_them() {
        let worker = validate_node_ports(
            DeploymentMode::Separated,
            NodeRole::Worker,
            5802,
            Some(8080),
            Some(5803),
        )
        .unwrap();
        assert_eq!(worker.api, None);
        assert_eq!(worker.worker, None);

        let separated_master = validate_node_ports(
            DeploymentMode::Separated,
            NodeRole::Master,
            5801,
            Some(8080),
            Some(5802),
        )
        .unwrap();
        assert_eq!(separated_master.api, Some(8080));
        assert_eq!(separated_master.worker, None);

        let hybrid_master = validate_node_ports(
            DeploymentMode::Hybrid,
            NodeRole::MasterWorker,
            5801,
            Some(8080),
            Some(5802),
        )
        .unwrap();
        assert_eq!(hybrid_master.worker, Some(5802));
    }

    #[test]
    fn test_invalid_optional_port_rejected() {
        let result = validate_node_ports(
            DeploymentMode::Hybrid,
            NodeRole::Master,
            5801,
            Some(70000),
            None,
        );
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_combined_role_requires_hybrid() {
        assert!(validate_role(DeploymentMode::Hybrid, NodeRole::MasterWorker).is_ok());
        assert!(validate_role(DeploymentMode::Separated, NodeRole::MasterWorker).is_err());
        assert!(validate_role(DeploymentMode::Separated, NodeRole::Worker).is_ok());
    }
}
