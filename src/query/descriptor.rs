//! Declarative query descriptors.
//!
//! A descriptor fixes everything about a query except the runtime bitmask:
//! projected columns, joined tables, flag-gated filter fragments and
//! pagination. Descriptors are immutable once built and validated.

use std::fmt;
use std::sync::Arc;

use crate::query::errors::DescriptorError;
use crate::query::value::TypeRef;
use crate::query::Flags;

/// Table identifier; `0` is the primary table.
pub type TableId = u32;

/// Tables addressable by a descriptor: the primary plus one per alias letter.
pub const MAX_TABLES: usize = 27;

/// Alias letter for a joined table (`a` for table 1, `b` for table 2, ...).
/// The primary table is never aliased.
pub fn alias(table: TableId) -> Option<char> {
    match table {
        1..=26 => char::from_u32('a' as u32 + table - 1),
        _ => None,
    }
}

/// Dotted column path rooted at a table.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ColumnPath {
    table: TableId,
    segments: Vec<Arc<str>>,
}

impl ColumnPath {
    /// Builds a path from explicit segments.
    pub fn new<I, S>(table: TableId, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Arc<str>>,
    {
        Self {
            table,
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// Splits `dotted` on `.`.
    pub fn parse(table: TableId, dotted: &str) -> Self {
        Self::new(table, dotted.split('.'))
    }

    /// Owning table.
    pub fn table(&self) -> TableId {
        self.table
    }

    /// Path segments, outermost first.
    pub fn segments(&self) -> &[Arc<str>] {
        &self.segments
    }

    fn is_blank(&self) -> bool {
        self.segments.is_empty() || self.segments.iter().any(|s| s.trim().is_empty())
    }

    /// Appends the SQL form: `col`, `a.col`, or `((a.s0).s1).s2` for nested
    /// sub-selections.
    pub fn render_into(&self, out: &mut String) {
        let Some((first, rest)) = self.segments.split_first() else {
            return;
        };
        let start = out.len();
        if let Some(letter) = alias(self.table) {
            out.push(letter);
            out.push('.');
        }
        out.push_str(first);
        for segment in rest {
            out.insert(start, '(');
            out.push_str(").");
            out.push_str(segment);
        }
    }
}

impl fmt::Display for ColumnPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.render_into(&mut out);
        f.write_str(&out)
    }
}

/// Join predicate `primary = alias.secondary`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinOn {
    /// Table qualifying the primary column; `0` leaves it unqualified.
    pub table: TableId,
    /// Column on the already-joined side.
    pub primary: Arc<str>,
    /// Column on the table being joined.
    pub secondary: Arc<str>,
}

/// One table of a descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableRef {
    /// Dense identifier, `0` for the primary table.
    pub id: TableId,
    /// SQL table name.
    pub name: Arc<str>,
    /// Left outer join predicate, required for every table but the primary.
    pub join: Option<JoinOn>,
}

/// One selected column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Projection {
    /// Column path.
    pub path: ColumnPath,
    /// Declared result type, driving the read operation.
    pub kind: TypeRef,
}

/// SQL fragment included when the bitmask selects it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilterFragment {
    /// Bits tested against the bitmask.
    pub mask: Flags,
    /// Required value of `flags & mask`; defaults to `mask` itself.
    pub mask_rq: Option<Flags>,
    /// Raw SQL with `?` placeholders.
    pub query: Arc<str>,
    /// One directive per placeholder, in placeholder order.
    pub values: Vec<Arc<str>>,
}

impl FilterFragment {
    /// Fragment included whenever every bit of `mask` is set.
    pub fn new<I, S>(mask: Flags, query: impl Into<Arc<str>>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Arc<str>>,
    {
        Self {
            mask,
            mask_rq: None,
            query: query.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Requires `flags & mask == mask_rq` instead of all mask bits set.
    pub fn requiring(mut self, mask_rq: Flags) -> Self {
        self.mask_rq = Some(mask_rq);
        self
    }

    /// Inclusion test for one bitmask.
    pub fn applies(&self, flags: Flags) -> bool {
        flags & self.mask == self.mask_rq.unwrap_or(self.mask)
    }

    /// Number of `?` placeholders outside single-quoted literals.
    pub fn placeholders(&self) -> usize {
        let mut quoted = false;
        let mut count = 0;
        for c in self.query.chars() {
            match c {
                '\'' => quoted = !quoted,
                '?' if !quoted => count += 1,
                _ => {}
            }
        }
        count
    }
}

/// Optional sort and paging.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Pagination {
    /// Sort column; always descending.
    pub sort: Option<ColumnPath>,
    /// Directive producing the row limit.
    pub limit: Option<Arc<str>>,
    /// Directive producing the row offset.
    pub offset: Option<Arc<str>>,
}

impl Pagination {
    /// Whether nothing is configured.
    pub fn is_empty(&self) -> bool {
        self.sort.is_none() && self.limit.is_none() && self.offset.is_none()
    }
}

/// Validated description of one query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryDescriptor {
    name: Arc<str>,
    tables: Vec<TableRef>,
    projections: Vec<Projection>,
    filters: Vec<FilterFragment>,
    pagination: Pagination,
}

impl QueryDescriptor {
    /// Starts a descriptor named `name` (used in diagnostics).
    pub fn builder(name: impl Into<Arc<str>>) -> DescriptorBuilder {
        DescriptorBuilder {
            name: name.into(),
            tables: Vec::new(),
            projections: Vec::new(),
            inherited: Vec::new(),
            filters: Vec::new(),
            pagination: Pagination::default(),
        }
    }

    /// Diagnostic name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tables in ascending id order.
    pub fn tables(&self) -> &[TableRef] {
        &self.tables
    }

    /// The `from` table.
    pub fn primary(&self) -> &TableRef {
        &self.tables[0]
    }

    /// Projections in declaration order.
    pub fn projections(&self) -> &[Projection] {
        &self.projections
    }

    /// Filter fragments, inherited ones first.
    pub fn filters(&self) -> &[FilterFragment] {
        &self.filters
    }

    /// Sort and paging.
    pub fn pagination(&self) -> &Pagination {
        &self.pagination
    }

    fn validate(&self) -> Result<(), DescriptorError> {
        let query = || self.name.to_string();
        if self.tables.len() > MAX_TABLES {
            return Err(DescriptorError::TooManyTables {
                query: query(),
                count: self.tables.len(),
                max: MAX_TABLES,
            });
        }
        if self.tables.first().map(|t| t.id) != Some(0) {
            return Err(DescriptorError::MissingPrimaryTable { query: query() });
        }
        for (pos, pair) in self.tables.windows(2).enumerate() {
            if pair[0].id == pair[1].id {
                return Err(DescriptorError::DuplicateTable {
                    query: query(),
                    id: pair[1].id,
                });
            }
            let expected = pos as TableId + 1;
            if pair[1].id != expected {
                return Err(DescriptorError::SparseTableIds {
                    query: query(),
                    expected,
                });
            }
        }
        let known = |id: TableId| (id as usize) < self.tables.len();
        for table in &self.tables {
            match (&table.join, table.id) {
                (Some(_), 0) => {
                    return Err(DescriptorError::PrimaryJoined {
                        query: query(),
                        name: table.name.to_string(),
                    })
                }
                (None, 0) => {}
                (None, id) => {
                    return Err(DescriptorError::MissingJoin {
                        query: query(),
                        id,
                        name: table.name.to_string(),
                    })
                }
                (Some(join), _) if !known(join.table) => {
                    return Err(DescriptorError::UnknownTable {
                        query: query(),
                        id: join.table,
                        context: "join",
                    })
                }
                (Some(_), _) => {}
            }
        }
        if self.projections.is_empty() {
            return Err(DescriptorError::NoProjections { query: query() });
        }
        let paths = self
            .projections
            .iter()
            .map(|p| (&p.path, "projection"))
            .chain(self.pagination.sort.iter().map(|p| (p, "sort")));
        for (path, context) in paths {
            if path.is_blank() {
                return Err(DescriptorError::EmptyPath {
                    query: query(),
                    context,
                });
            }
            if !known(path.table()) {
                return Err(DescriptorError::UnknownTable {
                    query: query(),
                    id: path.table(),
                    context,
                });
            }
        }
        for fragment in &self.filters {
            let placeholders = fragment.placeholders();
            if placeholders != fragment.values.len() {
                return Err(DescriptorError::PlaceholderMismatch {
                    query: query(),
                    fragment: fragment.query.to_string(),
                    placeholders,
                    values: fragment.values.len(),
                });
            }
        }
        Ok(())
    }
}

/// Fluent builder for [`QueryDescriptor`].
pub struct DescriptorBuilder {
    name: Arc<str>,
    tables: Vec<TableRef>,
    projections: Vec<Projection>,
    inherited: Vec<FilterFragment>,
    filters: Vec<FilterFragment>,
    pagination: Pagination,
}

impl DescriptorBuilder {
    /// Sets the primary table.
    pub fn from(mut self, name: impl Into<Arc<str>>) -> Self {
        self.tables.push(TableRef {
            id: 0,
            name: name.into(),
            join: None,
        });
        self
    }

    /// Left outer joins `name` as table `id` on `primary = alias.secondary`.
    pub fn join(
        self,
        id: TableId,
        name: impl Into<Arc<str>>,
        primary: impl Into<Arc<str>>,
        secondary: impl Into<Arc<str>>,
    ) -> Self {
        self.join_on(
            id,
            name,
            JoinOn {
                table: 0,
                primary: primary.into(),
                secondary: secondary.into(),
            },
        )
    }

    /// Joins with an explicit predicate, e.g. one qualified by another table.
    pub fn join_on(mut self, id: TableId, name: impl Into<Arc<str>>, join: JoinOn) -> Self {
        self.tables.push(TableRef {
            id,
            name: name.into(),
            join: Some(join),
        });
        self
    }

    /// Adds a projection of the dotted `path` on `table`.
    pub fn select(mut self, table: TableId, path: &str, kind: impl Into<TypeRef>) -> Self {
        self.projections.push(Projection {
            path: ColumnPath::parse(table, path),
            kind: kind.into(),
        });
        self
    }

    /// Adds a filter fragment.
    pub fn filter(mut self, fragment: FilterFragment) -> Self {
        self.filters.push(fragment);
        self
    }

    /// Adds shared fragments that precede the query's own.
    pub fn inherit(mut self, fragments: impl IntoIterator<Item = FilterFragment>) -> Self {
        self.inherited.extend(fragments);
        self
    }

    /// Sorts descending by the dotted `path` on `table`.
    pub fn sort(mut self, table: TableId, path: &str) -> Self {
        self.pagination.sort = Some(ColumnPath::parse(table, path));
        self
    }

    /// Sets the limit directive; blank directives mean no limit.
    pub fn limit(mut self, directive: &str) -> Self {
        self.pagination.limit = non_blank(directive);
        self
    }

    /// Sets the offset directive; blank directives mean no offset.
    pub fn offset(mut self, directive: &str) -> Self {
        self.pagination.offset = non_blank(directive);
        self
    }

    /// Validates and freezes the descriptor.
    pub fn build(self) -> Result<QueryDescriptor, DescriptorError> {
        let mut tables = self.tables;
        tables.sort_by_key(|t| t.id);
        let mut filters = self.inherited;
        filters.extend(self.filters);
        let descriptor = QueryDescriptor {
            name: self.name,
            tables,
            projections: self.projections,
            filters,
            pagination: self.pagination,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}

fn non_blank(directive: &str) -> Option<Arc<str>> {
    let trimmed = directive.trim();
    (!trimmed.is_empty()).then(|| Arc::from(trimmed))
}
