use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One entry in the organization's supplier catalogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Supplier {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub materials_offered: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
}

/// A supplier candidate produced by one matching pass for one result.
/// At most the top 3 matches per result are retained from a pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupplierMatch {
    pub extraction_result_id: Uuid,
    pub supplier_id: Uuid,
    pub confidence_score: f64,
    pub match_reason: String,
    pub is_selected: bool,
}
