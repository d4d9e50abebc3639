//! Read-only HTTP routes served over versioned shipping views.
//!
//! Each route names the principal it runs as and the columns it exposes.
//! Those must agree exactly with the grant table: every exposed column is
//! selectable by the principal, and the principal can select nothing else
//! on the view.

use crate::catalog::Catalog;
use crate::changes::{
    AUGUR_BUILD_EXPORTER, LATEST_RESULTS_EXPORTER, LATEST_RESULTS_V1,
    METADATA_FOR_AUGUR_BUILD_V1, RETURN_RESULTS_EXPORTER, RETURN_RESULTS_V1, RETURN_RESULTS_V2,
};
use crate::config::AclConfig;
use crate::error::{AclError, ResourceType};
use crate::permission::Action;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Route {
    pub method: String,
    /// Path template; `<name>` segments match any single segment.
    pub path: String,
    pub view: String,
    pub principal: String,
    pub columns: Vec<String>,
}

impl Route {
    pub fn get(path: &str, view: &str, principal: &str, columns: &[&str]) -> Self {
        Self {
            method: "GET".to_string(),
            path: path.to_string(),
            view: view.to_string(),
            principal: principal.to_string(),
            columns: columns.iter().map(|c| (*c).to_string()).collect(),
        }
    }

    pub fn matches(&self, method: &str, path: &str) -> bool {
        if !self.method.eq_ignore_ascii_case(method) {
            return false;
        }
        let template: Vec<&str> = self.path.trim_end_matches('/').split('/').collect();
        let actual: Vec<&str> = path.trim_end_matches('/').split('/').collect();
        template.len() == actual.len()
            && template.iter().zip(&actual).all(|(t, a)| {
                (t.starts_with('<') && t.ends_with('>') && !a.is_empty()) || t == a
            })
    }
}

pub fn shipping_routes() -> Vec<Route> {
    vec![
        Route::get(
            "/v1/shipping/return-results/<barcode>",
            RETURN_RESULTS_V2,
            RETURN_RESULTS_EXPORTER,
            &["barcode", "status_code", "collection_date", "result_ts"],
        ),
        Route::get(
            "/v1/shipping/augur-build-metadata",
            METADATA_FOR_AUGUR_BUILD_V1,
            AUGUR_BUILD_EXPORTER,
            &["strain", "date", "region", "country", "division", "location"],
        ),
        Route::get(
            "/v1/shipping/latest-results",
            LATEST_RESULTS_V1,
            LATEST_RESULTS_EXPORTER,
            &["barcode", "hcov19_result_received", "hcov19_present"],
        ),
    ]
}

/// Routes kept for clients that have not moved to a newer view version.
pub fn legacy_routes() -> Vec<Route> {
    vec![Route::get(
        "/v1/shipping/return-results-v1/<barcode>",
        RETURN_RESULTS_V1,
        RETURN_RESULTS_EXPORTER,
        &["barcode", "status"],
    )]
}

pub fn find_route<'a>(routes: &'a [Route], method: &str, path: &str) -> Result<&'a Route, AclError> {
    routes
        .iter()
        .find(|r| r.matches(method, path))
        .ok_or_else(|| AclError::not_found(ResourceType::Route, format!("{method} {path}")))
}

/// `principal` may serve `route` when it can select the view and every
/// exposed column.
pub fn authorize_route(
    catalog: &Catalog,
    config: &AclConfig,
    principal: &str,
    route: &Route,
) -> Result<(), AclError> {
    let mut allowed = catalog.can(principal, &route.view, Action::Select, None, config)?;
    for column in &route.columns {
        if !allowed {
            break;
        }
        allowed = catalog.can(principal, &route.view, Action::Select, Some(column), config)?;
    }
    if !allowed {
        return Err(AclError::PermissionDenied(format!(
            "{principal} may not serve {} {}",
            route.method, route.path
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RouteAudit {
    pub method: String,
    pub path: String,
    pub principal: String,
    /// Exposed but not selectable.
    pub missing: Vec<String>,
    /// Selectable but not exposed.
    pub unexpected: Vec<String>,
    /// The view or principal does not exist.
    pub error: Option<String>,
}

/// Routes whose exposed columns differ from the grants of their principal.
/// An empty result means every route agrees with the grant table.
pub fn audit_routes(catalog: &Catalog, config: &AclConfig, routes: &[Route]) -> Vec<RouteAudit> {
    let mut findings = Vec::new();
    for route in routes {
        let mut audit = RouteAudit {
            method: route.method.clone(),
            path: route.path.clone(),
            principal: route.principal.clone(),
            missing: Vec::new(),
            unexpected: Vec::new(),
            error: None,
        };
        match catalog.column_set(&route.principal, &route.view, Action::Select, config) {
            Ok(granted) => {
                audit.missing = route
                    .columns
                    .iter()
                    .filter(|c| !granted.contains(c))
                    .cloned()
                    .collect();
                audit.unexpected = granted
                    .into_iter()
                    .filter(|c| !route.columns.contains(c))
                    .collect();
            }
            Err(e) => audit.error = Some(e.to_string()),
        }
        if audit.missing.is_empty() && audit.unexpected.is_empty() && audit.error.is_none() {
            continue;
        }
        tracing::warn!(
            method = %audit.method,
            path = %audit.path,
            principal = %audit.principal,
            missing = ?audit.missing,
            unexpected = ?audit.unexpected,
            error = ?audit.error,
            "route does not match grants"
        );
        findings.push(audit);
    }
    findings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templates_match_single_segments() {
        let route = &shipping_routes()[0];
        assert!(route.matches("GET", "/v1/shipping/return-results/AAAA1111"));
        assert!(route.matches("get", "/v1/shipping/return-results/AAAA1111/"));
        assert!(!route.matches("POST", "/v1/shipping/return-results/AAAA1111"));
        assert!(!route.matches("GET", "/v1/shipping/return-results"));
        assert!(!route.matches("GET", "/v1/shipping/return-results/a/b"));
    }

    #[test]
    fn find_route_reports_unknown_paths() {
        let routes = shipping_routes();
        let found = find_route(&routes, "GET", "/v1/shipping/latest-results").expect("route");
        assert_eq!(found.view, LATEST_RESULTS_V1);
        assert!(
            find_route(&routes, "GET", "/v1/shipping/nope")
                .expect_err("unknown")
                .is_not_found()
        );
    }
}
