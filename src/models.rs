//! Catalog & Report Models
//!
//! Defines the value types shared by every layer of the engine:
//! - Recipe / CraftingOption: public catalog items
//! - Command: auxiliary reference data, never cross-referenced with recipes
//! - CatalogSnapshot: the complete catalog as fetched or cached
//! - Report / NewReport: user-submitted corrections with a remote status

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of slots in a crafting grid (3x3, row-major)
pub const CRAFTING_SLOT_COUNT: usize = 9;

/// Maximum interchangeable crafting options per recipe
pub const MAX_CRAFTING_OPTIONS: usize = 4;

// ============================================================================
// Catalog
// ============================================================================

/// One way to craft a recipe
///
/// `slots` always holds exactly [`CRAFTING_SLOT_COUNT`] entries; `None` is an
/// empty grid cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CraftingOption {
    pub slots: Vec<Option<String>>,
    pub yield_count: u32,
}

impl CraftingOption {
    /// Build an option from raw ingredient names, padding or truncating to the grid size.
    /// Blank names become empty slots.
    pub fn new(ingredients: Vec<String>, yield_count: u32) -> Self {
        let mut slots: Vec<Option<String>> = ingredients
            .into_iter()
            .take(CRAFTING_SLOT_COUNT)
            .map(|name| {
                let trimmed = name.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            })
            .collect();
        slots.resize(CRAFTING_SLOT_COUNT, None);

        Self {
            slots,
            yield_count: yield_count.max(1),
        }
    }

    /// True when every slot is empty
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Distinct ingredient names in slot order
    pub fn ingredients(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for name in self.slots.iter().flatten() {
            if !names.contains(&name.as_str()) {
                names.push(name);
            }
        }
        names
    }
}

/// Catalog item. Identity is stable across syncs, content is replaced wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    pub id: i64,
    pub name: String,
    pub image: String,
    pub options: Vec<CraftingOption>,
    pub category: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remark: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl Recipe {
    /// Case-insensitive substring match on the display name
    pub fn matches_name(&self, query: &str) -> bool {
        let query = query.trim().to_lowercase();
        query.is_empty() || self.name.to_lowercase().contains(&query)
    }
}

/// Reference command (chat command help entry)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub name: String,
    pub description: String,
    pub supports_java: bool,
    pub supports_bedrock: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub java_permission_level: Option<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bedrock_permission_level: Option<u8>,
}

/// Complete catalog as fetched from the remote store or read from disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    pub recipes: Vec<Recipe>,
    #[serde(default)]
    pub commands: Vec<Command>,
    pub fetched_at: DateTime<Utc>,
}

impl CatalogSnapshot {
    pub fn new(recipes: Vec<Recipe>, commands: Vec<Command>) -> Self {
        Self {
            recipes,
            commands,
            fetched_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.recipes.is_empty() && self.commands.is_empty()
    }
}

// ============================================================================
// Reports
// ============================================================================

/// What the user is reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    MissingRecipe,
    RecipeError,
}

impl ReportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportKind::MissingRecipe => "missing_recipe",
            ReportKind::RecipeError => "recipe_error",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "missing_recipe" => Ok(ReportKind::MissingRecipe),
            "recipe_error" => Ok(ReportKind::RecipeError),
            _ => Err(format!("Invalid report kind: {}", s)),
        }
    }
}

/// Review status, only ever changed by the back office
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    #[default]
    Pending,
    Resolved,
    Rejected,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Pending => "pending",
            ReportStatus::Resolved => "resolved",
            ReportStatus::Rejected => "rejected",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(ReportStatus::Pending),
            "resolved" => Ok(ReportStatus::Resolved),
            "rejected" => Ok(ReportStatus::Rejected),
            _ => Err(format!("Invalid report status: {}", s)),
        }
    }

    /// Resolved and rejected reports never change again
    pub fn is_final(&self) -> bool {
        !matches!(self, ReportStatus::Pending)
    }
}

/// A submitted report. Name, category and description are immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub id: String,
    pub kind: ReportKind,
    pub name: String,
    pub category: String,
    pub description: String,
    pub status: ReportStatus,
    pub created_at: DateTime<Utc>,
}

/// Validated input for a new report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReport {
    pub kind: ReportKind,
    pub name: String,
    pub category: String,
    pub description: String,
}

impl NewReport {
    /// Trim and check required fields.
    ///
    /// Name and category are always required; a recipe-error report also
    /// needs a description of what is wrong.
    pub fn validate(
        kind: ReportKind,
        name: &str,
        category: &str,
        description: &str,
    ) -> Result<Self, String> {
        let name = name.trim();
        let category = category.trim();
        let description = description.trim();

        if name.is_empty() {
            return Err("Recipe name is required".to_string());
        }
        if category.is_empty() {
            return Err("Category is required".to_string());
        }
        if kind == ReportKind::RecipeError && description.is_empty() {
            return Err("Please describe the error".to_string());
        }

        Ok(Self {
            kind,
            name: name.to_string(),
            category: category.to_string(),
            description: description.to_string(),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crafting_option_pads_to_grid() {
        let option = CraftingOption::new(vec!["Stick".to_string(), "Coal".to_string()], 4);
        assert_eq!(option.slots.len(), CRAFTING_SLOT_COUNT);
        assert_eq!(option.slots[0].as_deref(), Some("Stick"));
        assert!(option.slots[2..].iter().all(Option::is_none));
        assert_eq!(option.yield_count, 4);
    }

    #[test]
    fn test_crafting_option_truncates_and_blanks() {
        let ingredients = (0..12).map(|i| if i == 1 { "  ".to_string() } else { format!("Item{}", i) }).collect();
        let option = CraftingOption::new(ingredients, 0);
        assert_eq!(option.slots.len(), CRAFTING_SLOT_COUNT);
        assert!(option.slots[1].is_none());
        assert_eq!(option.slots[8].as_deref(), Some("Item8"));
        // zero yield is normalized
        assert_eq!(option.yield_count, 1);
    }

    #[test]
    fn test_crafting_option_distinct_ingredients() {
        let option = CraftingOption::new(
            vec!["Planks".into(), "Planks".into(), "".into(), "Stick".into()],
            1,
        );
        assert_eq!(option.ingredients(), vec!["Planks", "Stick"]);
        assert!(!option.is_empty());
        assert!(CraftingOption::new(vec![], 1).is_empty());
    }

    #[test]
    fn test_recipe_name_match() {
        let recipe = Recipe {
            id: 1,
            name: "Torch".to_string(),
            image: "torch.png".to_string(),
            options: vec![],
            category: "Lighting".to_string(),
            remark: None,
            note: None,
        };
        assert!(recipe.matches_name("tor"));
        assert!(recipe.matches_name(""));
        assert!(!recipe.matches_name("plank"));
    }

    #[test]
    fn test_report_enums_as_str() {
        assert_eq!(ReportKind::MissingRecipe.as_str(), "missing_recipe");
        assert_eq!(ReportKind::from_str("recipe_error"), Ok(ReportKind::RecipeError));
        assert!(ReportKind::from_str("other").is_err());

        assert_eq!(ReportStatus::Pending.as_str(), "pending");
        assert_eq!(ReportStatus::from_str("rejected"), Ok(ReportStatus::Rejected));
        assert!(!ReportStatus::Pending.is_final());
        assert!(ReportStatus::Resolved.is_final());
    }

    #[test]
    fn test_report_serialization() {
        let report = Report {
            id: "r-1".to_string(),
            kind: ReportKind::MissingRecipe,
            name: "Stairs".to_string(),
            category: "Building".to_string(),
            description: String::new(),
            status: ReportStatus::Pending,
            created_at: Utc::now(),
        };

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["kind"], "missing_recipe");
        assert_eq!(json["status"], "pending");

        let back: Report = serde_json::from_value(json).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn test_new_report_validation() {
        let ok = NewReport::validate(ReportKind::MissingRecipe, " Stairs ", "Building", "");
        assert_eq!(ok.unwrap().name, "Stairs");

        assert!(NewReport::validate(ReportKind::MissingRecipe, "", "Building", "").is_err());
        assert!(NewReport::validate(ReportKind::MissingRecipe, "Stairs", "  ", "").is_err());
        assert!(NewReport::validate(ReportKind::RecipeError, "Torch", "Lighting", " ").is_err());
        assert!(NewReport::validate(ReportKind::RecipeError, "Torch", "Lighting", "Wrong yield").is_ok());
    }
}
