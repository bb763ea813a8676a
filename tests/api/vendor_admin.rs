use serde_json::json;

use crate::helpers::spawn_app;

#[tokio::test]
async fn upserts_a_new_vendor() {
    let app = spawn_app().await;

    let body = json!({
        "vendor_name": "Adobe Inc",
        "expense_dept": "IT",
        "gl_code": "6100",
        "allocation_schedule": "MONTHLY",
        "billing_party": "HQ",
    });

    let response = app.post_vendor(body).await;
    assert_eq!(response.status().as_u16(), 201);

    let saved = app
        .context
        .kv_store
        .get_vendor(&invoice_agent::domain::NormalizedKey::normalize("Adobe Inc"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(saved.gl_code.to_string(), "6100");
    assert!(saved.active);
}

#[tokio::test]
async fn rejects_a_malformed_gl_code() {
    let app = spawn_app().await;

    let body = json!({
        "vendor_name": "Adobe Inc",
        "expense_dept": "IT",
        "gl_code": "61A0",
        "allocation_schedule": "MONTHLY",
        "billing_party": "HQ",
    });

    let response = app.post_vendor(body).await;
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn reupsert_preserves_active_flag_unless_overridden() {
    let app = spawn_app().await;

    let base = json!({
        "vendor_name": "Adobe Inc",
        "expense_dept": "IT",
        "gl_code": "6100",
        "allocation_schedule": "MONTHLY",
        "billing_party": "HQ",
        "active": false,
    });
    app.post_vendor(base).await;

    let reupsert = json!({
        "vendor_name": "Adobe Inc",
        "expense_dept": "IT",
        "gl_code": "6200",
        "allocation_schedule": "MONTHLY",
        "billing_party": "HQ",
    });
    let response = app.post_vendor(reupsert).await;
    assert_eq!(response.status().as_u16(), 201);

    let saved = app
        .context
        .kv_store
        .get_vendor(&invoice_agent::domain::NormalizedKey::normalize("Adobe Inc"))
        .await
        .unwrap()
        .unwrap();
    assert!(!saved.active);
    assert_eq!(saved.gl_code.to_string(), "6200");
}
