//! Full-table scans for analytical transactions.
//!
//! A [`ScanQuery`] selects rows with a conjunction of [`Conjunct`]s, each of
//! which holds if any of its predicates does, then returns the rows, a
//! projection of their columns or one row of aggregates. The remote store
//! evaluates the query next to the data; [`ScanQuery::execute`] is the
//! reference evaluation over rows visible in a snapshot.
use std::sync::Arc;

use errors::ErrorMetadata;
use value::{
    Field,
    FieldId,
    FieldType,
    Schema,
    Tuple,
};

use crate::types::TableId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
pub enum PredicateType {
    #[display("=")]
    Equal,
    #[display("!=")]
    NotEqual,
    #[display("<")]
    Less,
    #[display("<=")]
    LessEqual,
    #[display(">")]
    Greater,
    #[display(">=")]
    GreaterEqual,
    #[display("IS NULL")]
    IsNull,
    #[display("IS NOT NULL")]
    IsNotNull,
}

/// `field <predicate_type> value`. `value` is ignored by the null checks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Predicate {
    pub predicate_type: PredicateType,
    pub field: FieldId,
    pub value: Field,
}

impl Predicate {
    /// Comparisons against a null column are false.
    fn holds(&self, tuple: &Tuple) -> bool {
        let column = tuple.get(self.field).unwrap_or(&Field::Null);
        match self.predicate_type {
            PredicateType::IsNull => column.is_null(),
            PredicateType::IsNotNull => !column.is_null(),
            _ if column.is_null() => false,
            PredicateType::Equal => *column == self.value,
            PredicateType::NotEqual => *column != self.value,
            PredicateType::Less => *column < self.value,
            PredicateType::LessEqual => *column <= self.value,
            PredicateType::Greater => *column > self.value,
            PredicateType::GreaterEqual => *column >= self.value,
        }
    }
}

/// Predicates joined by OR.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Conjunct {
    predicates: Vec<Predicate>,
}

impl Conjunct {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn or(mut self, predicate_type: PredicateType, field: FieldId, value: Field) -> Self {
        self.predicates.push(Predicate {
            predicate_type,
            field,
            value,
        });
        self
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    fn holds(&self, tuple: &Tuple) -> bool {
        self.predicates.iter().any(|p| p.holds(tuple))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
pub enum AggregationType {
    #[display("min")]
    Min,
    #[display("max")]
    Max,
    #[display("sum")]
    Sum,
    /// Non-null values of the column.
    #[display("count")]
    Count,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScanKind {
    /// Whole rows.
    Full,
    /// The listed columns, in field id order.
    Projection(Vec<FieldId>),
    /// One row with a column per aggregation.
    Aggregation(Vec<(AggregationType, FieldId)>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanQuery {
    table: TableId,
    kind: ScanKind,
    conjuncts: Vec<Conjunct>,
}

impl ScanQuery {
    pub fn full(table: TableId) -> Self {
        Self {
            table,
            kind: ScanKind::Full,
            conjuncts: vec![],
        }
    }

    pub fn projection(table: TableId, mut fields: Vec<FieldId>) -> Self {
        fields.sort_unstable();
        fields.dedup();
        Self {
            table,
            kind: ScanKind::Projection(fields),
            conjuncts: vec![],
        }
    }

    pub fn aggregation(table: TableId, aggregations: Vec<(AggregationType, FieldId)>) -> Self {
        Self {
            table,
            kind: ScanKind::Aggregation(aggregations),
            conjuncts: vec![],
        }
    }

    /// Only scan rows for which `conjunct` holds too.
    pub fn and(mut self, conjunct: Conjunct) -> Self {
        self.conjuncts.push(conjunct);
        self
    }

    pub fn table(&self) -> TableId {
        self.table
    }

    pub fn kind(&self) -> &ScanKind {
        &self.kind
    }

    pub fn conjuncts(&self) -> &[Conjunct] {
        &self.conjuncts
    }

    /// Check the query against the table's schema: every column exists,
    /// predicate values have the column's type and only numeric columns are
    /// aggregated.
    pub fn verify(&self, schema: &Schema) -> anyhow::Result<()> {
        let column = |id: FieldId| {
            schema.field(id).ok_or_else(|| {
                ErrorMetadata::bad_request(
                    "FieldDoesNotExist",
                    format!("Table {} has no column with id {id}", self.table),
                )
            })
        };
        for predicate in self.conjuncts.iter().flat_map(Conjunct::predicates) {
            let descriptor = column(predicate.field)?;
            if matches!(
                predicate.predicate_type,
                PredicateType::IsNull | PredicateType::IsNotNull
            ) {
                continue;
            }
            if predicate.value.field_type() != Some(descriptor.field_type) {
                anyhow::bail!(ErrorMetadata::bad_request(
                    "WrongFieldType",
                    format!(
                        "Can't compare column {:?} of type {} with {}",
                        descriptor.name, descriptor.field_type, predicate.value
                    ),
                ));
            }
        }
        match &self.kind {
            ScanKind::Full => (),
            ScanKind::Projection(fields) => {
                anyhow::ensure!(
                    !fields.is_empty(),
                    ErrorMetadata::bad_request("EmptyProjection", "Projection has no columns")
                );
                for id in fields {
                    column(*id)?;
                }
            },
            ScanKind::Aggregation(aggregations) => {
                anyhow::ensure!(
                    !aggregations.is_empty(),
                    ErrorMetadata::bad_request("EmptyAggregation", "Aggregation has no columns")
                );
                for (aggregation, id) in aggregations {
                    let descriptor = column(*id)?;
                    if !descriptor.field_type.is_fixed_size() {
                        anyhow::bail!(ErrorMetadata::bad_request(
                            "WrongFieldType",
                            format!(
                                "Can't {aggregation} over column {:?} of type {}",
                                descriptor.name, descriptor.field_type
                            ),
                        ));
                    }
                }
            },
        }
        Ok(())
    }

    /// Whether every conjunct holds for `tuple`.
    pub fn matches(&self, tuple: &Tuple) -> bool {
        self.conjuncts.iter().all(|c| c.holds(tuple))
    }

    /// Schema of the rows the query returns for a table with `schema`.
    pub fn result_schema(&self, schema: &Arc<Schema>) -> anyhow::Result<Arc<Schema>> {
        let fields = match &self.kind {
            ScanKind::Full => return Ok(schema.clone()),
            ScanKind::Projection(fields) => {
                let mut result = Schema::new(schema.table_type());
                for id in fields {
                    let descriptor = schema
                        .field(*id)
                        .ok_or_else(|| anyhow::anyhow!("Unknown field id {id}"))?;
                    result.add_field(
                        descriptor.field_type,
                        descriptor.name.clone(),
                        descriptor.not_null,
                    )?;
                }
                result
            },
            ScanKind::Aggregation(aggregations) => {
                let mut result = Schema::new(schema.table_type());
                for (aggregation, id) in aggregations {
                    let descriptor = schema
                        .field(*id)
                        .ok_or_else(|| anyhow::anyhow!("Unknown field id {id}"))?;
                    let is_float =
                        matches!(descriptor.field_type, FieldType::Float | FieldType::Double);
                    let field_type = match aggregation {
                        AggregationType::Min | AggregationType::Max => descriptor.field_type,
                        AggregationType::Sum if is_float => FieldType::Double,
                        AggregationType::Sum | AggregationType::Count => FieldType::BigInt,
                    };
                    // Min and max of no rows are null.
                    let not_null = matches!(aggregation, AggregationType::Count);
                    result.add_field(
                        field_type,
                        format!("{aggregation}_{}", descriptor.name),
                        not_null,
                    )?;
                }
                result
            },
        };
        Ok(Arc::new(fields))
    }

    /// Evaluate the query over `rows`, all of which belong to a table with
    /// `schema`. The query must have passed `verify`.
    pub fn execute<'a>(
        &self,
        schema: &Arc<Schema>,
        rows: impl IntoIterator<Item = &'a Tuple>,
    ) -> anyhow::Result<Vec<Tuple>> {
        let result_schema = self.result_schema(schema)?;
        let selected = rows.into_iter().filter(|tuple| self.matches(tuple));
        match &self.kind {
            ScanKind::Full => Ok(selected.cloned().collect()),
            ScanKind::Projection(fields) => selected
                .map(|tuple| {
                    let mut projected = Tuple::new(result_schema.clone());
                    for (position, id) in fields.iter().enumerate() {
                        let value = tuple.get(*id).cloned().unwrap_or(Field::Null);
                        projected.set(position as FieldId, value)?;
                    }
                    Ok(projected)
                })
                .collect(),
            ScanKind::Aggregation(aggregations) => {
                let mut accumulators: Vec<Accumulator> = aggregations
                    .iter()
                    .map(|(aggregation, _)| Accumulator::new(*aggregation))
                    .collect();
                for tuple in selected {
                    for (accumulator, (_, id)) in accumulators.iter_mut().zip(aggregations) {
                        if let Some(value) = tuple.get(*id).filter(|v| !v.is_null()) {
                            accumulator.add(value)?;
                        }
                    }
                }
                let mut row = Tuple::new(result_schema);
                for (position, accumulator) in accumulators.into_iter().enumerate() {
                    row.set(position as FieldId, accumulator.finish())?;
                }
                Ok(vec![row])
            },
        }
    }
}

enum Accumulator {
    Min(Option<Field>),
    Max(Option<Field>),
    SumInt(i64),
    SumFloat(Option<f64>),
    Count(i64),
}

impl Accumulator {
    fn new(aggregation: AggregationType) -> Self {
        match aggregation {
            AggregationType::Min => Accumulator::Min(None),
            AggregationType::Max => Accumulator::Max(None),
            // The column type decides between the two sums on the first value.
            AggregationType::Sum => Accumulator::SumFloat(None),
            AggregationType::Count => Accumulator::Count(0),
        }
    }

    fn add(&mut self, value: &Field) -> anyhow::Result<()> {
        match self {
            Accumulator::Min(min) => {
                if min.as_ref().is_none_or(|m| value < m) {
                    *min = Some(value.clone());
                }
            },
            Accumulator::Max(max) => {
                if max.as_ref().is_none_or(|m| value > m) {
                    *max = Some(value.clone());
                }
            },
            Accumulator::SumFloat(None) if value.as_i64().is_ok() => {
                *self = Accumulator::SumInt(value.as_i64()?);
            },
            Accumulator::SumFloat(sum) => *sum = Some(sum.unwrap_or(0.0) + value.as_f64()?),
            Accumulator::SumInt(sum) => {
                *sum = sum.checked_add(value.as_i64()?).ok_or_else(|| {
                    ErrorMetadata::bad_request("SumOverflow", "Sum does not fit in a BIGINT")
                })?;
            },
            Accumulator::Count(count) => *count += 1,
        }
        Ok(())
    }

    fn finish(self) -> Field {
        match self {
            Accumulator::Min(value) | Accumulator::Max(value) => value.unwrap_or(Field::Null),
            Accumulator::SumInt(sum) => Field::BigInt(sum),
            Accumulator::SumFloat(sum) => sum.map(Field::Double).unwrap_or(Field::Null),
            Accumulator::Count(count) => Field::BigInt(count),
        }
    }
}
