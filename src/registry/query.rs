//! Query Options Translator
//!
//! Turns an abstract listing request (filters, sorting, page/size, optional
//! search term) into a [`NativeQuerySpec`]: a predicate tree, the classifier
//! join list, an order list and optional limit/offset. Every field name is
//! checked against the descriptor, so only known identifiers reach SQL.

use chrono::{Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::descriptor::{ColumnDescriptor, RegistryDescriptor};
use super::value::{CellValue, DataType};
use crate::error::{RegistryError, Result};
use crate::ports::TERRITORY_COLUMN;

// ============================================================================
// Request types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOperator {
    #[serde(rename = "=", alias = "$eq")]
    Eq,
    #[serde(rename = "!=", alias = "$ne")]
    Ne,
    #[serde(rename = ">", alias = "$gt")]
    Gt,
    #[serde(rename = ">=", alias = "$gte")]
    Ge,
    #[serde(rename = "<", alias = "$lt")]
    Lt,
    #[serde(rename = "<=", alias = "$lte")]
    Le,
    #[serde(rename = "ilike", alias = "$iLike")]
    ILike,
    #[serde(rename = "in", alias = "$in")]
    In,
    #[serde(rename = "notIn", alias = "$notIn")]
    NotIn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterSpec {
    pub field: String,
    pub operator: FilterOperator,
    #[serde(default)]
    pub value: Option<JsonValue>,
    /// Client hint: `date` or `datetime`.
    #[serde(default, rename = "type")]
    pub value_type: Option<String>,
    #[serde(default)]
    pub hide_empty: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    #[serde(alias = "ASC")]
    Asc,
    #[serde(alias = "DESC")]
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

/// A listing request as received from a caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRequest {
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub size: Option<u32>,
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
    #[serde(default)]
    pub sorting: Vec<SortSpec>,
    #[serde(default)]
    pub search: Option<String>,
    /// Skip territory scoping.
    #[serde(default)]
    pub all_records: bool,
}

// ============================================================================
// Native query specification
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnRef {
    Base(String),
    Joined { alias: String, column: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Compare {
        column: ColumnRef,
        op: CompareOp,
        value: CellValue,
        data_type: DataType,
        /// Compare `date(column)` rather than the column itself.
        date_only: bool,
    },
    TextMatch {
        column: ColumnRef,
        pattern: String,
    },
    IsNotNull(ColumnRef),
    In {
        column: ColumnRef,
        values: Vec<CellValue>,
        data_type: DataType,
        negated: bool,
    },
}

/// `LEFT JOIN` of one classifier table.
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    /// Key of the classifier column this join serves.
    pub field_key: String,
    pub alias: String,
    pub schema: String,
    pub table: String,
    pub key_column: String,
    pub foreign_key_column: String,
    pub display_column: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub column: ColumnRef,
    pub descending: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NativeQuerySpec {
    pub predicate: Option<Predicate>,
    pub joins: Vec<Join>,
    pub order: Vec<OrderBy>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl NativeQuerySpec {
    /// Same filters and joins, no ordering or paging; used for counts.
    pub fn unpaged(&self) -> NativeQuerySpec {
        NativeQuerySpec {
            predicate: self.predicate.clone(),
            joins: self.joins.clone(),
            order: Vec::new(),
            limit: None,
            offset: None,
        }
    }
}

// ============================================================================
// Translation
// ============================================================================

/// Translate `request` for `descriptor`. `territory_scope`, when set,
/// restricts the territory column to the given ids.
pub fn translate(
    request: &ListRequest,
    descriptor: &RegistryDescriptor,
    territory_scope: Option<&[Uuid]>,
) -> Result<NativeQuerySpec> {
    let (limit, offset) = pagination(request.page, request.size)?;
    let joins = classifier_joins(descriptor);

    let mut predicates = Vec::new();
    for filter in &request.filters {
        if let Some(p) = translate_filter(filter, descriptor)? {
            predicates.push(p);
        }
    }

    if let Some(term) = request.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        predicates.push(search_predicate(term, descriptor));
    }

    if let Some(territories) = territory_scope {
        if descriptor.column(TERRITORY_COLUMN).is_some() {
            predicates.push(Predicate::In {
                column: ColumnRef::Base(TERRITORY_COLUMN.to_string()),
                values: territories.iter().copied().map(CellValue::Uuid).collect(),
                data_type: DataType::Uuid,
                negated: false,
            });
        }
    }

    let order = if request.sorting.is_empty() {
        vec![OrderBy {
            column: ColumnRef::Base(descriptor.primary_key().key.clone()),
            descending: false,
        }]
    } else {
        request
            .sorting
            .iter()
            .map(|s| {
                let column = scalar_column(descriptor, &s.field)?;
                Ok(OrderBy {
                    column: display_ref(column).unwrap_or_else(|| ColumnRef::Base(column.key.clone())),
                    descending: s.direction == SortDirection::Desc,
                })
            })
            .collect::<Result<Vec<_>>>()?
    };

    Ok(NativeQuerySpec {
        predicate: (!predicates.is_empty()).then_some(Predicate::And(predicates)),
        joins,
        order,
        limit,
        offset,
    })
}

/// `page` and `size` are both set or both absent. Zero counts as absent.
fn pagination(page: Option<u32>, size: Option<u32>) -> Result<(Option<i64>, Option<i64>)> {
    match (page.filter(|p| *p > 0), size.filter(|s| *s > 0)) {
        (None, None) => Ok((None, None)),
        (Some(page), Some(size)) => {
            let size = i64::from(size);
            Ok((Some(size), Some((i64::from(page) - 1) * size)))
        }
        _ => Err(RegistryError::InvalidQuery(
            "page and size must be given together".into(),
        )),
    }
}

/// One join per classifier column, aliased by the column's field id.
pub fn classifier_joins(descriptor: &RegistryDescriptor) -> Vec<Join> {
    descriptor
        .classifier_columns()
        .filter_map(|c| {
            let cls = c.classifier.as_ref()?;
            Some(Join {
                field_key: c.key.clone(),
                alias: c.join_alias(),
                schema: cls.schema.clone(),
                table: cls.table.clone(),
                key_column: cls.key_column.clone(),
                foreign_key_column: c.key.clone(),
                display_column: cls.display_column.clone(),
            })
        })
        .collect()
}

fn scalar_column<'a>(descriptor: &'a RegistryDescriptor, field: &str) -> Result<&'a ColumnDescriptor> {
    descriptor
        .column(field)
        .filter(|c| c.is_scalar())
        .ok_or_else(|| RegistryError::InvalidQuery(format!("unknown field '{field}'")))
}

/// Joined display column of a classifier, with its type.
fn display_ref(column: &ColumnDescriptor) -> Option<ColumnRef> {
    let cls = column.classifier.as_ref()?;
    Some(ColumnRef::Joined {
        alias: column.join_alias(),
        column: cls.display_column.clone()?,
    })
}

fn translate_filter(filter: &FilterSpec, descriptor: &RegistryDescriptor) -> Result<Option<Predicate>> {
    let column = scalar_column(descriptor, &filter.field)?;

    // Anything but key equality on a classifier goes to its display column.
    let (target, data_type) = match (filter.operator, display_ref(column)) {
        (FilterOperator::Eq, _) | (_, None) => (ColumnRef::Base(column.key.clone()), column.data_type),
        (_, Some(joined)) => {
            let display_type = column
                .classifier
                .as_ref()
                .and_then(|c| c.display_type)
                .unwrap_or(DataType::Text);
            (joined, display_type)
        }
    };

    let mut parts = Vec::new();
    if filter.hide_empty {
        parts.push(Predicate::IsNotNull(target.clone()));
    }

    match filter.value.as_ref().filter(|v| !v.is_null()) {
        None => {}
        Some(value) => parts.push(value_predicate(filter, target, data_type, value)?),
    }

    Ok(match parts.len() {
        0 => None,
        1 => parts.pop(),
        _ => Some(Predicate::And(parts)),
    })
}

fn value_predicate(
    filter: &FilterSpec,
    column: ColumnRef,
    data_type: DataType,
    value: &JsonValue,
) -> Result<Predicate> {
    let hint = filter.value_type.as_deref();
    let is_datetime = data_type.is_datetime() || hint == Some("datetime");
    let is_date = data_type.is_date() || hint == Some("date") || is_datetime;

    let op = match filter.operator {
        FilterOperator::ILike => {
            let text = json_text(value);
            return Ok(Predicate::TextMatch {
                column,
                pattern: format!("%{text}%"),
            });
        }
        FilterOperator::In | FilterOperator::NotIn => {
            let items = value.as_array().ok_or_else(|| {
                RegistryError::InvalidQuery(format!("'{}' expects a list of values", filter.field))
            })?;
            let values = items
                .iter()
                .map(|v| coerce(&filter.field, v, data_type, is_date))
                .collect::<Result<Vec<_>>>()?;
            let data_type = if is_date { DataType::Date } else { data_type };
            return Ok(Predicate::In {
                column,
                values,
                data_type,
                negated: filter.operator == FilterOperator::NotIn,
            });
        }
        FilterOperator::Eq => CompareOp::Eq,
        FilterOperator::Ne => CompareOp::Ne,
        FilterOperator::Gt => CompareOp::Gt,
        FilterOperator::Ge => CompareOp::Ge,
        FilterOperator::Lt => CompareOp::Lt,
        FilterOperator::Le => CompareOp::Le,
    };

    let value = coerce(&filter.field, value, data_type, is_date)?;
    Ok(Predicate::Compare {
        column,
        op,
        value,
        data_type: if is_date { DataType::Date } else { data_type },
        date_only: is_datetime && op == CompareOp::Eq,
    })
}

fn coerce(field: &str, value: &JsonValue, data_type: DataType, is_date: bool) -> Result<CellValue> {
    if is_date {
        let text = json_text(value);
        return normalize_date(&text)
            .map(CellValue::Date)
            .ok_or_else(|| RegistryError::InvalidQuery(format!("invalid date '{text}' for '{field}'")));
    }
    CellValue::from_json(value, data_type)
        .map_err(|e| RegistryError::InvalidQuery(format!("'{field}': {e}")))
}

fn json_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Accepts `DD.MM.YYYY`, `DD.MM` (current year) and `YYYY-MM-DD`, with an
/// optional time part after the date. Invalid calendar dates are rejected.
pub fn normalize_date(raw: &str) -> Option<NaiveDate> {
    let date_part = raw.trim().split(['T', ' ']).next().unwrap_or_default();
    if let Ok(d) = NaiveDate::parse_from_str(date_part, "%Y-%m-%d") {
        return Some(d);
    }
    if let Ok(d) = NaiveDate::parse_from_str(date_part, "%d.%m.%Y") {
        return Some(d);
    }
    let (day, month) = date_part.split_once('.')?;
    NaiveDate::from_ymd_opt(Utc::now().year(), month.parse().ok()?, day.parse().ok()?)
}

/// `ILIKE` over every text column and every classifier display column.
fn search_predicate(term: &str, descriptor: &RegistryDescriptor) -> Predicate {
    let pattern = format!("%{term}%");
    let mut alternatives = Vec::new();
    for column in descriptor.scalar_columns() {
        if let Some(joined) = display_ref(column) {
            alternatives.push(Predicate::TextMatch {
                column: joined,
                pattern: pattern.clone(),
            });
        } else if column.is_text() {
            alternatives.push(Predicate::TextMatch {
                column: ColumnRef::Base(column.key.clone()),
                pattern: pattern.clone(),
            });
        }
    }
    Predicate::Or(alternatives)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::descriptor::tests::wells_descriptor;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn filter(field: &str, operator: FilterOperator, value: JsonValue) -> FilterSpec {
        FilterSpec {
            field: field.into(),
            operator,
            value: Some(value),
            value_type: None,
            hide_empty: false,
        }
    }

    #[test]
    fn defaults_to_primary_key_ascending_without_paging() {
        let d = wells_descriptor();
        let spec = translate(&ListRequest::default(), &d, None).unwrap();
        assert_eq!(
            spec.order,
            vec![OrderBy {
                column: ColumnRef::Base("id".into()),
                descending: false
            }]
        );
        assert_eq!(spec.limit, None);
        assert_eq!(spec.offset, None);
        assert_eq!(spec.predicate, None);
    }

    #[test]
    fn page_and_size_go_together() {
        let d = wells_descriptor();
        let request = ListRequest {
            page: Some(3),
            size: Some(25),
            ..Default::default()
        };
        let spec = translate(&request, &d, None).unwrap();
        assert_eq!((spec.limit, spec.offset), (Some(25), Some(50)));

        let half = ListRequest {
            page: Some(1),
            ..Default::default()
        };
        assert!(matches!(
            translate(&half, &d, None),
            Err(RegistryError::InvalidQuery(_))
        ));
    }

    #[test]
    fn classifier_display_filter_uses_single_join() {
        let d = wells_descriptor();
        let zone = d.column("zone").unwrap();
        let request = ListRequest {
            filters: vec![filter("zone", FilterOperator::ILike, json!("Zone"))],
            ..Default::default()
        };
        let spec = translate(&request, &d, None).unwrap();

        let matching: Vec<_> = spec.joins.iter().filter(|j| j.alias == zone.join_alias()).collect();
        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].table, "zones");
        assert_eq!(
            spec.predicate,
            Some(Predicate::And(vec![Predicate::TextMatch {
                column: ColumnRef::Joined {
                    alias: zone.join_alias(),
                    column: "title".into()
                },
                pattern: "%Zone%".into(),
            }]))
        );
    }

    #[test]
    fn classifier_key_equality_stays_on_base_column() {
        let d = wells_descriptor();
        let code = Uuid::new_v4();
        let request = ListRequest {
            filters: vec![filter("zone", FilterOperator::Eq, json!(code.to_string()))],
            ..Default::default()
        };
        let spec = translate(&request, &d, None).unwrap();
        let Some(Predicate::And(parts)) = spec.predicate else {
            panic!("expected predicate");
        };
        assert_eq!(
            parts[0],
            Predicate::Compare {
                column: ColumnRef::Base("zone".into()),
                op: CompareOp::Eq,
                value: CellValue::Uuid(code),
                data_type: DataType::Uuid,
                date_only: false,
            }
        );
    }

    #[test]
    fn invalid_calendar_date_is_rejected() {
        let d = wells_descriptor();
        let mut f = filter("name", FilterOperator::Eq, json!("2023-13-45"));
        f.value_type = Some("date".into());
        let request = ListRequest {
            filters: vec![f],
            ..Default::default()
        };
        assert!(matches!(
            translate(&request, &d, None),
            Err(RegistryError::InvalidQuery(_))
        ));
    }

    #[test]
    fn date_formats_normalize() {
        let expected = NaiveDate::from_ymd_opt(2023, 3, 7).unwrap();
        assert_eq!(normalize_date("07.03.2023"), Some(expected));
        assert_eq!(normalize_date("2023-03-07"), Some(expected));
        assert_eq!(normalize_date("2023-03-07T10:00:00Z"), Some(expected));
        assert_eq!(
            normalize_date("07.03").map(|d| (d.month(), d.day())),
            Some((3, 7))
        );
        assert_eq!(normalize_date("31.02.2023"), None);
        assert_eq!(normalize_date("yesterday"), None);
    }

    #[test]
    fn hide_empty_adds_not_null_alongside_value() {
        let d = wells_descriptor();
        let mut f = filter("depth", FilterOperator::Gt, json!(100));
        f.hide_empty = true;
        let request = ListRequest {
            filters: vec![f],
            ..Default::default()
        };
        let spec = translate(&request, &d, None).unwrap();
        let Some(Predicate::And(outer)) = spec.predicate else {
            panic!("expected predicate");
        };
        let Predicate::And(parts) = &outer[0] else {
            panic!("expected conjunction");
        };
        assert_eq!(parts[0], Predicate::IsNotNull(ColumnRef::Base("depth".into())));
        assert!(matches!(parts[1], Predicate::Compare { op: CompareOp::Gt, .. }));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let d = wells_descriptor();
        let request = ListRequest {
            sorting: vec![SortSpec {
                field: "drop table".into(),
                direction: SortDirection::Asc,
            }],
            ..Default::default()
        };
        assert!(translate(&request, &d, None).is_err());
    }

    #[test]
    fn classifier_sort_uses_display_column() {
        let d = wells_descriptor();
        let request = ListRequest {
            sorting: vec![SortSpec {
                field: "zone".into(),
                direction: SortDirection::Desc,
            }],
            ..Default::default()
        };
        let spec = translate(&request, &d, None).unwrap();
        assert_eq!(
            spec.order[0].column,
            ColumnRef::Joined {
                alias: d.column("zone").unwrap().join_alias(),
                column: "title".into()
            }
        );
        assert!(spec.order[0].descending);
    }

    #[test]
    fn search_covers_text_and_display_columns() {
        let d = wells_descriptor();
        let request = ListRequest {
            search: Some("north".into()),
            ..Default::default()
        };
        let spec = translate(&request, &d, None).unwrap();
        let Some(Predicate::And(parts)) = spec.predicate else {
            panic!("expected predicate");
        };
        let Predicate::Or(alternatives) = &parts[0] else {
            panic!("expected disjunction");
        };
        // name (text) and zone (display)
        assert_eq!(alternatives.len(), 2);
    }

    #[test]
    fn in_filter_requires_a_list() {
        let d = wells_descriptor();
        let request = ListRequest {
            filters: vec![filter("name", FilterOperator::In, json!("Well-1"))],
            ..Default::default()
        };
        assert!(translate(&request, &d, None).is_err());
    }

    #[test]
    fn operators_deserialize_from_both_spellings() {
        let f: FilterSpec =
            serde_json::from_value(json!({"field": "name", "operator": "$iLike", "value": "x"})).unwrap();
        assert_eq!(f.operator, FilterOperator::ILike);
        let f: FilterSpec =
            serde_json::from_value(json!({"field": "name", "operator": "notIn", "value": []})).unwrap();
        assert_eq!(f.operator, FilterOperator::NotIn);
    }
}
