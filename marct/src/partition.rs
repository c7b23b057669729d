//! Lazily created list partitions of the projection table.
//!
//! The projection is partitioned by `field` and every field partition is partitioned again by
//! `sf`. Partition names derive from the parent table: `{table}_{field}` and
//! `{table}_{field}_{sf}`, where the subfield part is folded so that codes differing only in
//! case never share a name.

use std::collections::HashSet;

use marct_postgres::schema::TableName;
use pg_escape::quote_literal;
use tracing::debug;

use crate::client::PgClient;
use crate::error::MarctResult;
use crate::types::Category;

/// Returns the name fragment used for a subfield code.
///
/// Lowercase letters and digits are kept, uppercase letters become a doubled lowercase letter
/// (`A` gives `aa`) and anything else is hex-escaped behind an underscore (empty gives `_`).
pub fn subfield_suffix(sf: &str) -> String {
    let mut chars = sf.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_lowercase() || c.is_ascii_digit() => c.to_string(),
        (Some(c), None) if c.is_ascii_uppercase() => {
            let lower = c.to_ascii_lowercase();
            format!("{lower}{lower}")
        }
        _ => {
            let escaped: String = sf.bytes().map(|b| format!("{b:02x}")).collect();
            format!("_{escaped}")
        }
    }
}

/// Name of the partition holding `category` under `parent`.
pub fn field_partition_name(parent: &TableName, category: Category) -> TableName {
    parent.with_suffix(&format!("_{category}"))
}

/// Name of the partition holding `(category, sf)` under `parent`.
pub fn subfield_partition_name(parent: &TableName, category: Category, sf: &str) -> TableName {
    parent.with_suffix(&format!("_{category}_{}", subfield_suffix(sf)))
}

/// Creates partitions on first use and remembers what this run already created.
#[derive(Debug)]
pub struct PartitionManager {
    parent: TableName,
    categories: HashSet<Category>,
    seen: HashSet<(Category, String)>,
}

impl PartitionManager {
    pub fn new(parent: TableName) -> PartitionManager {
        PartitionManager {
            parent,
            categories: HashSet::new(),
            seen: HashSet::new(),
        }
    }

    /// Whether `(category, sf)` was already ensured during this run.
    pub fn is_known(&self, category: Category, sf: &str) -> bool {
        self.seen.contains(&(category, sf.to_owned()))
    }

    /// Makes sure the partitions for `(category, sf)` exist.
    ///
    /// Creation is `if not exists`, so partitions left by earlier runs are reused.
    pub async fn ensure(&mut self, client: &PgClient, category: Category, sf: &str) -> MarctResult<()> {
        if self.is_known(category, sf) {
            return Ok(());
        }

        let field_partition = field_partition_name(&self.parent, category);
        if !self.categories.contains(&category) {
            client
                .batch_execute(&format!(
                    "create table if not exists {} partition of {} for values in ({}) partition by list (sf)",
                    field_partition.as_quoted_identifier(),
                    self.parent.as_quoted_identifier(),
                    quote_literal(&category.to_string()),
                ))
                .await?;
            self.categories.insert(category);
        }

        let subfield_partition = subfield_partition_name(&self.parent, category, sf);
        client
            .batch_execute(&format!(
                "create table if not exists {} partition of {} for values in ({})",
                subfield_partition.as_quoted_identifier(),
                field_partition.as_quoted_identifier(),
                quote_literal(sf),
            ))
            .await?;

        debug!(partition = %subfield_partition, "partition ready");
        self.seen.insert((category, sf.to_owned()));

        Ok(())
    }

    /// Categories that have a partition, in ascending order.
    pub fn categories(&self) -> Vec<Category> {
        let mut categories: Vec<_> = self.categories.iter().copied().collect();
        categories.sort();
        categories
    }

    /// Renames pairs mapping every partition created under the current parent to the name it
    /// gets once the parent is renamed to `new_parent`.
    ///
    /// Subfield partitions come before field partitions.
    pub fn renames_for(&self, new_parent: &TableName) -> Vec<(TableName, String)> {
        let mut seen: Vec<_> = self.seen.iter().collect();
        seen.sort();

        let subfields = seen.into_iter().map(|(category, sf)| {
            (
                subfield_partition_name(&self.parent, *category, sf),
                subfield_partition_name(new_parent, *category, sf).name,
            )
        });
        let fields = self.categories().into_iter().map(|category| {
            (
                field_partition_name(&self.parent, category),
                field_partition_name(new_parent, category).name,
            )
        });

        subfields.chain(fields).collect()
    }
}
