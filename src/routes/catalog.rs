//! The platform's compiled-in route groupings.

use crate::{
    config::{GatewayConfig, ServiceEndpoint},
    error::RouteTableError,
    routes::{RouteSpec, RouteTable},
};

/// Builds the table for every backend from configuration. Prefixes are
/// relative to the public base path; each rewrite strips the base path.
pub fn platform_routes(config: &GatewayConfig) -> Result<RouteTable, RouteTableError> {
    let services = &config.services;
    let groups: [(&str, &ServiceEndpoint); 14] = [
        ("/auth", &services.user),
        ("/users", &services.user),
        ("/admin/users", &services.user),
        ("/courses", &services.course),
        ("/learning-paths", &services.course),
        ("/enrollments", &services.course),
        ("/labs", &services.lab),
        ("/payments", &services.payment),
        ("/subscriptions", &services.payment),
        ("/admin", &services.admin),
        ("/marketing", &services.marketing),
        ("/community", &services.community),
        ("/forums", &services.community),
        ("/qa", &services.community),
    ];

    let mut builder = RouteTable::builder();
    for (prefix, endpoint) in groups {
        builder.add_route(
            RouteSpec::new(prefix, &endpoint.name, &endpoint.base_url)
                .rewrite(format!("^{}{}", regex::escape(&config.base_path), prefix), prefix)
                .timeout_ms(endpoint.timeout_ms),
        )?;
    }
    builder.build()
}
