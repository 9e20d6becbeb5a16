//! Field and column descriptors.
//!
//! Entities describe their columns with static `FieldInfo` slices instead of
//! runtime reflection. The session uses them to build select lists and to
//! validate mapper output; backends use them to create tables.

/// Metadata about an entity field/column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldInfo {
    /// Rust field name
    pub name: &'static str,
    /// Backend column name (may differ from field name)
    pub column_name: &'static str,
    /// Whether this field is nullable
    pub nullable: bool,
    /// Whether this is the primary key
    pub primary_key: bool,
    /// Table referenced by this column, for association foreign keys
    pub references: Option<&'static str>,
}

impl FieldInfo {
    /// Create a new non-nullable field whose column has the same name.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            column_name: name,
            nullable: false,
            primary_key: false,
            references: None,
        }
    }

    /// Set the backend column name.
    pub const fn column(mut self, name: &'static str) -> Self {
        self.column_name = name;
        self
    }

    /// Set nullable flag.
    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    /// Set primary key flag.
    pub const fn primary_key(mut self, value: bool) -> Self {
        self.primary_key = value;
        self
    }

    /// Mark this column as a foreign key into `table`.
    pub const fn references(mut self, table: &'static str) -> Self {
        self.references = Some(table);
        self
    }
}

/// Find the descriptor for `column` in a field list.
pub fn find_column(fields: &'static [FieldInfo], column: &str) -> Option<&'static FieldInfo> {
    fields.iter().find(|f| f.column_name == column)
}
