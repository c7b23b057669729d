//! Names and SQL of every relation a projection run reads or writes.

use marct_config::shared::TableLayout;
use marct_postgres::schema::TableName;
use pg_escape::quote_identifier;

/// Columns of the projection table in load order.
pub const PROJECTION_COLUMNS: [&str; 11] = [
    "srs_id",
    "line",
    "matched_id",
    "instance_hrid",
    "instance_id",
    "field",
    "ind1",
    "ind2",
    "ord",
    "sf",
    "content",
];

/// Columns that get a secondary index after a full load.
const INDEXED_COLUMNS: [&str; 5] = ["srs_id", "matched_id", "instance_hrid", "instance_id", "field, sf"];

const WORKING_SUFFIX: &str = "__tmp";
const CHECKSUM_SUFFIX: &str = "__cksum";
const METADATA_SUFFIX: &str = "__metadata";

/// Which source records a scan selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFilter {
    /// Only records in the current lifecycle state.
    Current,
    /// Records whose id is listed in the given temporary id table.
    IdsIn(&'static str),
}

/// Resolved relation names of one deployment.
#[derive(Debug, Clone)]
pub struct ProjectionTables {
    pub records: TableName,
    pub content: TableName,
    pub target: TableName,
    pub working: TableName,
    pub checksum: TableName,
    pub metadata: TableName,
    id_column: String,
    matched_id_column: String,
    external_hrid_column: String,
    state_column: String,
    content_column: String,
}

impl ProjectionTables {
    pub fn new(layout: &TableLayout) -> ProjectionTables {
        let target = TableName::new(&layout.target_schema, &layout.target_table);

        ProjectionTables {
            records: TableName::new(&layout.records_schema, &layout.records_table),
            content: TableName::new(&layout.content_schema, &layout.content_table),
            working: target.with_suffix(WORKING_SUFFIX),
            checksum: target.with_suffix(CHECKSUM_SUFFIX),
            metadata: target.with_suffix(METADATA_SUFFIX),
            target,
            id_column: quote_identifier(&layout.id_column).into_owned(),
            matched_id_column: quote_identifier(&layout.matched_id_column).into_owned(),
            external_hrid_column: quote_identifier(&layout.external_hrid_column).into_owned(),
            state_column: quote_identifier(&layout.state_column).into_owned(),
            content_column: quote_identifier(&layout.content_column).into_owned(),
        }
    }

    /// The digest over the comparison-relevant attributes of a record.
    ///
    /// Evaluated against the aliases `r` (records) and `c` (content). Attributes are separated by
    /// the unit separator so that shifting text between neighbours changes the digest.
    pub fn digest_expression(&self) -> String {
        format!(
            "md5(coalesce(r.{hrid}::text, '') || chr(31) || coalesce(r.{matched}::text, '') || \
             chr(31) || coalesce(r.{state}::text, '') || chr(31) || coalesce(c.{content}::text, ''))",
            hrid = self.external_hrid_column,
            matched = self.matched_id_column,
            state = self.state_column,
            content = self.content_column,
        )
    }

    /// The `from` clause joining records with their content.
    fn source_join(&self) -> String {
        format!(
            "{records} r join {content} c on c.{id} = r.{id}",
            records = self.records.as_quoted_identifier(),
            content = self.content.as_quoted_identifier(),
            id = self.id_column,
        )
    }

    /// Selects `(id, matched_id, external_hrid, state, content, digest)` as text.
    pub fn source_query(&self, filter: SourceFilter) -> String {
        let select = format!(
            "select r.{id}::text, coalesce(r.{matched}::text, ''), coalesce(r.{hrid}::text, ''), \
             coalesce(r.{state}::text, ''), coalesce(c.{content}::text, ''), {digest} from {join}",
            id = self.id_column,
            matched = self.matched_id_column,
            hrid = self.external_hrid_column,
            state = self.state_column,
            content = self.content_column,
            digest = self.digest_expression(),
            join = self.source_join(),
        );

        match filter {
            SourceFilter::Current => format!("{select} where {}", self.current_condition()),
            SourceFilter::IdsIn(ids) => format!(
                "{select} join {ids} k on k.id = r.{id}::uuid",
                ids = quote_identifier(ids),
                id = self.id_column,
            ),
        }
    }

    fn current_condition(&self) -> String {
        format!("r.{} = 'ACTUAL'", self.state_column)
    }

    pub fn count_source_sql(&self) -> String {
        format!("select count(*) from {}", self.source_join())
    }

    /// Ids of current source records missing from the checksum snapshot.
    pub fn added_ids_sql(&self) -> String {
        format!(
            "select r.{id}::uuid from {join} where {current} \
             and not exists (select 1 from {checksum} k where k.id = r.{id}::uuid)",
            id = self.id_column,
            join = self.source_join(),
            current = self.current_condition(),
            checksum = self.checksum.as_quoted_identifier(),
        )
    }

    /// Ids in the checksum snapshot that no longer have a source record.
    pub fn deleted_ids_sql(&self) -> String {
        format!(
            "select k.id from {checksum} k where not exists \
             (select 1 from {join} where r.{id}::uuid = k.id)",
            checksum = self.checksum.as_quoted_identifier(),
            join = self.source_join(),
            id = self.id_column,
        )
    }

    /// Ids present on both sides whose stored digest differs from the current one.
    pub fn changed_ids_sql(&self) -> String {
        format!(
            "select k.id from {checksum} k join {join} on r.{id}::uuid = k.id \
             where k.cksum <> {digest}",
            checksum = self.checksum.as_quoted_identifier(),
            join = self.source_join(),
            id = self.id_column,
            digest = self.digest_expression(),
        )
    }

    /// Fills a fresh checksum table with the digest of every record present in the projection.
    pub fn snapshot_checksums_sql(&self) -> String {
        format!(
            "insert into {checksum} (id, cksum) select r.{id}::uuid, {digest} from {join} \
             where r.{id}::uuid in (select distinct srs_id from {target})",
            checksum = self.checksum.as_quoted_identifier(),
            id = self.id_column,
            digest = self.digest_expression(),
            join = self.source_join(),
            target = self.target.as_quoted_identifier(),
        )
    }
}

/// DDL of a projection table partitioned by field.
pub fn create_projection_table_sql(table: &TableName) -> String {
    format!(
        "create table {} (\
         srs_id uuid not null, \
         line integer not null, \
         matched_id uuid not null, \
         instance_hrid varchar not null, \
         instance_id uuid not null, \
         field varchar(3) not null, \
         ind1 varchar(1) not null, \
         ind2 varchar(1) not null, \
         ord integer not null, \
         sf varchar(1) not null, \
         content varchar not null\
         ) partition by list (field)",
        table.as_quoted_identifier()
    )
}

/// Index statements run after a full load. Index names are left to the server.
pub fn create_index_statements(table: &TableName) -> Vec<String> {
    INDEXED_COLUMNS
        .iter()
        .map(|columns| format!("create index on {} ({columns})", table.as_quoted_identifier()))
        .collect()
}

pub fn create_trigram_index_sql(table: &TableName) -> String {
    format!(
        "create index on {} using gin (content gin_trgm_ops)",
        table.as_quoted_identifier()
    )
}

pub fn create_checksum_table_sql(table: &TableName) -> String {
    format!(
        "create table {} (id uuid primary key, cksum text not null)",
        table.as_quoted_identifier()
    )
}

pub fn create_metadata_table_sql(table: &TableName) -> String {
    format!(
        "create table {} (version integer not null)",
        table.as_quoted_identifier()
    )
}

pub fn drop_table_sql(table: &TableName) -> String {
    format!("drop table if exists {} cascade", table.as_quoted_identifier())
}

pub fn insert_row_sql(table: &TableName) -> String {
    let placeholders: Vec<String> = (1..=PROJECTION_COLUMNS.len())
        .map(|n| format!("${n}"))
        .collect();

    format!(
        "insert into {} ({}) values ({})",
        table.as_quoted_identifier(),
        PROJECTION_COLUMNS.join(", "),
        placeholders.join(", ")
    )
}
