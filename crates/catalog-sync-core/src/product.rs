//! Catalog-side data shapes consumed by the association builder and the checksum engine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::mapping::{dedupe, MappingValue};
use crate::{CategoryId, ProductId, SyncError, SystemId};

/// Canonical hierarchical category owned by the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Category {
    pub id: CategoryId,
    pub name: String,
    #[serde(default)]
    pub parent: Option<CategoryId>,
    #[serde(default)]
    pub depth: u32,
}

#[derive(Debug, Clone, Default)]
pub struct CategoryTree {
    nodes: BTreeMap<CategoryId, Category>,
}

impl CategoryTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns [`SyncError::Validation`] when a category names itself as parent.
    pub fn from_categories(
        categories: impl IntoIterator<Item = Category>,
    ) -> Result<Self, SyncError> {
        let mut tree = Self::new();
        for category in categories {
            tree.insert(category)?;
        }
        Ok(tree)
    }

    /// # Errors
    /// Returns [`SyncError::Validation`] when the category names itself as parent.
    pub fn insert(&mut self, category: Category) -> Result<(), SyncError> {
        if category.parent == Some(category.id) {
            return Err(SyncError::Validation(format!(
                "category {} MUST NOT be its own parent",
                category.id
            )));
        }
        self.nodes.insert(category.id, category);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, id: CategoryId) -> Option<&Category> {
        self.nodes.get(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn categories(&self) -> impl Iterator<Item = &Category> + '_ {
        self.nodes.values()
    }

    /// Ancestors of `id`, nearest first. A parent cycle stops the walk.
    #[must_use]
    pub fn ancestors(&self, id: CategoryId) -> Vec<CategoryId> {
        let mut ancestors = Vec::new();
        let mut cursor = self.nodes.get(&id).and_then(|category| category.parent);
        while let Some(parent) = cursor {
            if parent == id || ancestors.contains(&parent) {
                break;
            }
            ancestors.push(parent);
            cursor = self.nodes.get(&parent).and_then(|category| category.parent);
        }
        ancestors
    }

    /// `ids` followed by every ancestor not already present, deduplicated.
    #[must_use]
    pub fn expand(&self, ids: &[CategoryId]) -> Vec<CategoryId> {
        let mut expanded = ids.to_vec();
        for id in ids {
            expanded.extend(self.ancestors(*id));
        }
        dedupe(expanded)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PriceEntry {
    /// Price tier code, e.g. `retail` or `wholesale`.
    pub tier: String,
    pub net_minor: i64,
    pub gross_minor: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StockEntry {
    pub warehouse: String,
    pub quantity: i64,
}

/// Catalog product. Optional fields default to empty values so the syncable
/// projection is always computable.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Product {
    pub id: ProductId,
    pub sku: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub short_description: String,
    #[serde(default)]
    pub long_description: String,
    #[serde(default)]
    pub weight_grams: Option<u64>,
    /// Default tax rate in basis points (`2300` = 23%).
    #[serde(default)]
    pub tax_rate_bp: Option<u32>,
    #[serde(default)]
    pub categories: Vec<CategoryId>,
    #[serde(default)]
    pub prices: Vec<PriceEntry>,
    #[serde(default)]
    pub stock: Vec<StockEntry>,
}

impl Product {
    #[must_use]
    pub fn new(id: ProductId, sku: impl Into<String>) -> Self {
        Self {
            id,
            sku: sku.into(),
            name: String::new(),
            short_description: String::new(),
            long_description: String::new(),
            weight_grams: None,
            tax_rate_bp: None,
            categories: Vec::new(),
            prices: Vec::new(),
            stock: Vec::new(),
        }
    }

    /// Sum of stock across `warehouses` (all warehouses when `None`), floored at zero.
    #[must_use]
    pub fn stock_for(&self, warehouses: Option<&[String]>) -> i64 {
        let total = self
            .stock
            .iter()
            .filter(|entry| match warehouses {
                Some(allowed) => allowed.contains(&entry.warehouse),
                None => true,
            })
            .fold(0_i64, |sum, entry| sum.saturating_add(entry.quantity));
        total.max(0)
    }
}

/// A product's relationship to one downstream system, with per-system overrides.
///
/// `mapping` is persisted separately from the listing document and is never
/// part of its serialized form.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SystemListing {
    pub product_id: ProductId,
    pub system: SystemId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tax_rate_bp: Option<u32>,
    /// Warehouses feeding this system's stock; `None` means every warehouse.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warehouses: Option<Vec<String>>,
    #[serde(skip)]
    pub mapping: MappingValue,
}

impl SystemListing {
    #[must_use]
    pub fn new(product_id: ProductId, system: SystemId) -> Self {
        Self {
            product_id,
            system,
            name: None,
            short_description: None,
            long_description: None,
            tax_rate_bp: None,
            warehouses: None,
            mapping: MappingValue::Empty,
        }
    }

    #[must_use]
    pub fn effective_name<'a>(&'a self, product: &'a Product) -> &'a str {
        self.name.as_deref().unwrap_or(&product.name)
    }

    #[must_use]
    pub fn effective_short_description<'a>(&'a self, product: &'a Product) -> &'a str {
        self.short_description.as_deref().unwrap_or(&product.short_description)
    }

    #[must_use]
    pub fn effective_long_description<'a>(&'a self, product: &'a Product) -> &'a str {
        self.long_description.as_deref().unwrap_or(&product.long_description)
    }

    /// Per-system override, then the product default, then zero.
    #[must_use]
    pub fn effective_tax_rate_bp(&self, product: &Product) -> u32 {
        self.tax_rate_bp.or(product.tax_rate_bp).unwrap_or(0)
    }

    #[must_use]
    pub fn effective_stock(&self, product: &Product) -> i64 {
        product.stock_for(self.warehouses.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn category(id: u64, parent: Option<u64>, depth: u32) -> Category {
        Category {
            id: CategoryId(id),
            name: format!("category-{id}"),
            parent: parent.map(CategoryId),
            depth,
        }
    }

    #[test]
    fn ancestors_walk_to_root_and_stop_on_cycles() -> Result<(), SyncError> {
        let tree = CategoryTree::from_categories([
            category(1, None, 0),
            category(10, Some(1), 1),
            category(100, Some(10), 2),
            category(7, Some(8), 1),
            category(8, Some(7), 1),
        ])?;

        assert_eq!(tree.ancestors(CategoryId(100)), vec![CategoryId(10), CategoryId(1)]);
        assert_eq!(tree.ancestors(CategoryId(7)), vec![CategoryId(8)]);
        assert!(tree.ancestors(CategoryId(999)).is_empty());
        assert_eq!(
            tree.expand(&[CategoryId(100), CategoryId(10)]),
            vec![CategoryId(100), CategoryId(10), CategoryId(1)]
        );
        Ok(())
    }

    #[test]
    fn self_parent_is_rejected() {
        assert!(CategoryTree::from_categories([category(3, Some(3), 0)]).is_err());
    }

    #[test]
    fn listing_overrides_fall_back_to_product_defaults() {
        let mut product = Product::new(ProductId(1), "SKU-1");
        product.name = "Drill".to_string();
        product.tax_rate_bp = Some(2300);
        product.stock = vec![
            StockEntry { warehouse: "main".to_string(), quantity: 5 },
            StockEntry { warehouse: "outlet".to_string(), quantity: -9 },
        ];

        let mut listing = SystemListing::new(ProductId(1), SystemId(1));
        assert_eq!(listing.effective_name(&product), "Drill");
        assert_eq!(listing.effective_tax_rate_bp(&product), 2300);
        assert_eq!(listing.effective_stock(&product), 0);

        listing.name = Some("Cordless drill".to_string());
        listing.tax_rate_bp = Some(800);
        listing.warehouses = Some(vec!["main".to_string()]);
        assert_eq!(listing.effective_name(&product), "Cordless drill");
        assert_eq!(listing.effective_tax_rate_bp(&product), 800);
        assert_eq!(listing.effective_stock(&product), 5);
    }

    #[test]
    fn missing_optional_fields_deserialize_to_defaults() -> Result<(), serde_json::Error> {
        let product: Product = serde_json::from_str(r#"{"id": 4, "sku": "A-4"}"#)?;
        assert!(product.categories.is_empty());
        assert_eq!(product.weight_grams, None);

        let listing = SystemListing::new(ProductId(4), SystemId(2));
        assert_eq!(listing.effective_tax_rate_bp(&product), 0);
        assert_eq!(serde_json::to_value(&listing)?, serde_json::json!({"product_id": 4, "system": 2}));
        Ok(())
    }
}
