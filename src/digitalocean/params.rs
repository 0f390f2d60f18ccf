//! Query parameter construction for v1 endpoints.

use crate::provider::ProvisioningRequest;

/// Query parameters as ordered key/value pairs.
pub(super) type Params = Vec<(String, String)>;

/// Chooses `<field>_id` for numeric values and `<field>_slug` otherwise.
pub(super) fn slug_or_id_key(field: &str, value: &str) -> String {
    if !value.is_empty() && value.bytes().all(|byte| byte.is_ascii_digit()) {
        format!("{field}_id")
    } else {
        format!("{field}_slug")
    }
}

pub(super) fn create_params(request: &ProvisioningRequest) -> Params {
    let mut params = vec![(String::from("name"), request.name.clone())];
    for (field, value) in [
        ("region", &request.region),
        ("size", &request.size),
        ("image", &request.image),
    ] {
        params.push((slug_or_id_key(field, value), value.clone()));
    }
    if !request.ssh_key_ids.is_empty() {
        let keys = request
            .ssh_key_ids
            .iter()
            .map(|key| key.as_str())
            .collect::<Vec<_>>()
            .join(",");
        params.push((String::from("ssh_key_ids"), keys));
    }
    params.push((String::from("private_networking"), String::from("false")));
    params.push((String::from("backups_enabled"), String::from("false")));
    params
}

pub(super) fn destroy_params(scrub: bool) -> Params {
    vec![(String::from("scrub"), scrub.to_string())]
}
