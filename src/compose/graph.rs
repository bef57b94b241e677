//! Service dependency graph

use super::config::ComposeConfig;
use crate::error::{KeelError, Result};
use std::collections::HashSet;

/// Services in an order where every service comes after everything it
/// depends on. Ties are broken by service name so the order is stable.
///
/// A dependency on an undeclared service or a cycle is
/// `InvalidComposeGraph`.
pub fn deploy_order(config: &ComposeConfig) -> Result<Vec<String>> {
    let mut order = Vec::with_capacity(config.services.len());
    let mut visited = HashSet::new();
    let mut path = Vec::new();

    for service_name in config.services.keys() {
        visit(config, service_name, &mut visited, &mut path, &mut order)?;
    }

    Ok(order)
}

fn visit(
    config: &ComposeConfig,
    service: &str,
    visited: &mut HashSet<String>,
    path: &mut Vec<String>,
    order: &mut Vec<String>,
) -> Result<()> {
    if visited.contains(service) {
        return Ok(());
    }

    if let Some(start) = path.iter().position(|s| s == service) {
        let mut cycle = path[start..].to_vec();
        cycle.push(service.to_string());
        return Err(KeelError::InvalidComposeGraph(format!(
            "dependency cycle: {}",
            cycle.join(" -> ")
        )));
    }

    let Some(service_config) = config.services.get(service) else {
        let dependent = path.last().map(String::as_str).unwrap_or_default();
        return Err(KeelError::InvalidComposeGraph(format!(
            "service '{}' depends on undefined service '{}'",
            dependent, service
        )));
    };

    path.push(service.to_string());
    for dep in service_config.dependencies() {
        visit(config, &dep, visited, path, order)?;
    }
    path.pop();

    visited.insert(service.to_string());
    order.push(service.to_string());

    Ok(())
}
