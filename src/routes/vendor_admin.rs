use actix_web::web;
use actix_web::HttpResponse;
use serde::Deserialize;
use serde::Serialize;

use crate::context::ApplicationContext;
use crate::domain::GlCode;
use crate::domain::NormalizedKey;
use crate::domain::Vendor;
use crate::domain::CURRENT_SCHEMA_VERSION;
use crate::error::CoreError;

#[derive(Debug, Deserialize)]
pub struct UpsertVendorRequest {
    pub vendor_name: String,
    pub expense_dept: String,
    pub gl_code: String,
    pub allocation_schedule: String,
    pub billing_party: String,
    pub product_category: Option<String>,
    pub active: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct UpsertVendorResponse {
    pub normalized_key: String,
    pub display_name: String,
    pub expense_dept: String,
    pub gl_code: String,
    pub allocation_schedule: String,
    pub billing_party: String,
    pub product_category: Option<String>,
    pub active: bool,
}

impl From<Vendor> for UpsertVendorResponse {
    fn from(vendor: Vendor) -> Self {
        Self {
            normalized_key: vendor.normalized_key.as_ref().to_string(),
            display_name: vendor.display_name,
            expense_dept: vendor.expense_dept,
            gl_code: vendor.gl_code.to_string(),
            allocation_schedule: vendor.allocation_schedule,
            billing_party: vendor.billing_party,
            product_category: vendor.product_category,
            active: vendor.active,
        }
    }
}

/// `POST /vendors`. `NormalizedKey` is always recomputed
/// server-side from `vendor_name`, overriding any client-supplied value — the
/// request body has no field for it at all. An existing row's `active` flag
/// survives the upsert unless the request explicitly overrides it.
pub async fn upsert_vendor(
    body: web::Json<UpsertVendorRequest>,
    context: web::Data<ApplicationContext>,
) -> Result<HttpResponse, CoreError> {
    let body = body.into_inner();
    let gl_code = GlCode::parse(body.gl_code).map_err(CoreError::Validation)?;
    if body.vendor_name.trim().is_empty() {
        return Err(CoreError::Validation("vendor_name must not be empty".to_string()));
    }
    if body.expense_dept.trim().is_empty() {
        return Err(CoreError::Validation("expense_dept must not be empty".to_string()));
    }

    let normalized_key = NormalizedKey::normalize(&body.vendor_name);
    let existing = context.kv_store.get_vendor(&normalized_key).await?;
    let active = body.active.unwrap_or_else(|| existing.as_ref().map(|v| v.active).unwrap_or(true));

    let vendor = Vendor {
        normalized_key,
        display_name: body.vendor_name,
        expense_dept: body.expense_dept,
        gl_code,
        allocation_schedule: body.allocation_schedule,
        billing_party: body.billing_party,
        product_category: body.product_category,
        active,
        schema_version: CURRENT_SCHEMA_VERSION.to_string(),
    };

    context.kv_store.upsert_vendor(&vendor).await?;
    Ok(HttpResponse::Created().json(UpsertVendorResponse::from(vendor)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_gl_code() {
        assert!(GlCode::parse("12a4".to_string()).is_err());
    }

    #[test]
    fn normalized_key_ignores_client_input_entirely() {
        // UpsertVendorRequest has no normalized_key field, so there is
        // nothing for a client-supplied value to override.
        let key = NormalizedKey::normalize("Adobe, Inc.");
        assert_eq!(key.as_ref(), "adobe_inc");
    }
}
