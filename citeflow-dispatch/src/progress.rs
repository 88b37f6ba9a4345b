//! Progress queries used by polling clients

use crate::error::Result;
use crate::model::ServiceResponse;
use crate::registry::Collection;
use crate::store::DispatchStore;
use std::collections::BTreeMap;
use uuid::Uuid;

/// True while any service of the request is Queued or InProgress
pub async fn any_in_progress(store: &dyn DispatchStore, request_id: Uuid) -> Result<bool> {
    Ok(store.count_in_flight(request_id).await? > 0)
}

/// True while any in-flight service declares `type_value` among its outputs
pub async fn service_type_in_progress(
    store: &dyn DispatchStore,
    collection: &Collection,
    request_id: Uuid,
    type_value: &str,
) -> Result<bool> {
    let records = store.dispatched_services(request_id).await?;

    Ok(records
        .iter()
        .filter(|record| record.status.is_in_flight())
        .filter_map(|record| collection.get(&record.service_id))
        .any(|service| service.service_types().iter().any(|t| t == type_value)))
}

/// Group responses by type value, preserving creation order within a type
pub fn group_by_type(responses: Vec<ServiceResponse>) -> BTreeMap<String, Vec<ServiceResponse>> {
    let mut grouped: BTreeMap<String, Vec<ServiceResponse>> = BTreeMap::new();
    for response in responses {
        grouped
            .entry(response.service_type_value.clone())
            .or_default()
            .push(response);
    }
    grouped
}
