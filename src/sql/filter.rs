//! Declarative query shape: filters, sort and pagination.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOperator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Nin,
    Like,
    Ilike,
    Contains,
    StartsWith,
    EndsWith,
    IsNull,
    IsNotNull,
    Between,
    JsonContains,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::Eq => "eq",
            FilterOperator::Neq => "neq",
            FilterOperator::Gt => "gt",
            FilterOperator::Gte => "gte",
            FilterOperator::Lt => "lt",
            FilterOperator::Lte => "lte",
            FilterOperator::In => "in",
            FilterOperator::Nin => "nin",
            FilterOperator::Like => "like",
            FilterOperator::Ilike => "ilike",
            FilterOperator::Contains => "contains",
            FilterOperator::StartsWith => "startsWith",
            FilterOperator::EndsWith => "endsWith",
            FilterOperator::IsNull => "isNull",
            FilterOperator::IsNotNull => "isNotNull",
            FilterOperator::Between => "between",
            FilterOperator::JsonContains => "jsonContains",
        }
    }

    /// Placeholders the operator consumes.
    pub fn arity(&self) -> usize {
        match self {
            FilterOperator::IsNull | FilterOperator::IsNotNull => 0,
            FilterOperator::Between => 2,
            _ => 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryFilter {
    /// Field name, field id or column name.
    pub field: String,
    pub operator: FilterOperator,
    #[serde(default)]
    pub value: Value,
}

impl QueryFilter {
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: Value) -> Self {
        QueryFilter {
            field: field.into(),
            operator,
            value,
        }
    }

    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, FilterOperator::Eq, value)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuerySort {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl QuerySort {
    pub fn asc(field: impl Into<String>) -> Self {
        QuerySort {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        QuerySort {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }
}

pub const MAX_LIMIT: u64 = 1000;
/// Page size used when `page` is given without `limit`.
pub const DEFAULT_PAGE_SIZE: u64 = 20;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryPagination {
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub offset: Option<u64>,
    /// 1-based; wins over `offset`.
    #[serde(default)]
    pub page: Option<u64>,
}

impl QueryPagination {
    pub fn limit(limit: u64) -> Self {
        QueryPagination {
            limit: Some(limit),
            ..Default::default()
        }
    }

    pub fn page(page: u64, limit: u64) -> Self {
        QueryPagination {
            limit: Some(limit),
            offset: None,
            page: Some(page),
        }
    }

    /// Effective (limit, offset), limit capped at `MAX_LIMIT`.
    pub fn resolve(&self) -> (Option<u64>, Option<u64>) {
        let limit = match (self.limit, self.page) {
            (Some(l), _) => Some(l.min(MAX_LIMIT)),
            (None, Some(_)) => Some(DEFAULT_PAGE_SIZE),
            (None, None) => None,
        };
        let offset = match (self.page, limit) {
            (Some(page), Some(l)) => Some(page.max(1).saturating_sub(1).saturating_mul(l)),
            _ => self.offset,
        };
        (limit, offset)
    }
}

/// Options for list reads.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindOptions {
    #[serde(default)]
    pub filters: Vec<QueryFilter>,
    #[serde(default)]
    pub sort: Vec<QuerySort>,
    #[serde(default)]
    pub pagination: QueryPagination,
    /// Relation names resolved and attached under their name.
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub with_deleted: bool,
}

impl FindOptions {
    pub fn filter(mut self, filter: QueryFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn sort(mut self, sort: QuerySort) -> Self {
        self.sort.push(sort);
        self
    }

    pub fn paginate(mut self, pagination: QueryPagination) -> Self {
        self.pagination = pagination;
        self
    }

    pub fn include(mut self, relation: impl Into<String>) -> Self {
        self.include.push(relation.into());
        self
    }

    pub fn with_deleted(mut self) -> Self {
        self.with_deleted = true;
        self
    }
}
