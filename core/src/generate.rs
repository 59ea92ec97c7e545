//! Statement builders. Every function is a pure composition of
//! resolver-derived identifiers and compiled fragments: identical inputs
//! produce byte-identical SQL.

use crate::expression::{CompiledModifier, QueryInformation};
use crate::helpers::{qualified_table, quote_ident, quoted_column_list};
use crate::mapping::{ColumnMapping, TableSpec};

fn names<'a>(columns: &[&'a ColumnMapping]) -> Vec<&'a str> {
    columns.iter().map(|c| c.name_in_database.as_str()).collect()
}

/// Staging DDL: a transient table holding exactly the columns being moved.
pub fn build_create_staging(columns: &[&ColumnMapping], staged_name: &str) -> String {
    let column_defs = columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name_in_database), c.sql_type.as_ddl()))
        .collect::<Vec<String>>()
        .join(", ");
    format!("CREATE TEMP TABLE {} ({})", quote_ident(staged_name), column_defs)
}

/// Binary COPY statement targeting the staging table.
pub fn build_copy_in(staged_name: &str, columns: &[&ColumnMapping]) -> String {
    format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT binary)",
        quote_ident(staged_name),
        quoted_column_list(&names(columns)),
    )
}

/// Multi-row VALUES insert into the staging table, one placeholder per
/// cell. The small-batch alternative to COPY.
pub fn build_values_insert(staged_name: &str, columns: &[&ColumnMapping], rows: usize) -> String {
    let width = columns.len();
    let mut groups = Vec::with_capacity(rows);
    for row in 0..rows {
        let placeholders: Vec<String> =
            (1..=width).map(|col| format!("${}", row * width + col)).collect();
        groups.push(format!("({})", placeholders.join(", ")));
    }
    format!(
        "INSERT INTO {} ({}) VALUES {}",
        quote_ident(staged_name),
        quoted_column_list(&names(columns)),
        groups.join(", "),
    )
}

/// Set-based insert from the staging table. Store-generated columns are
/// excluded from the column list and flow back through RETURNING so
/// callers can observe generated keys.
pub fn build_insert_select(spec: &TableSpec, staged_name: &str) -> String {
    let insertable = names(&spec.insertable_columns());
    let column_list = quoted_column_list(&insertable);
    let mut sql = format!(
        "INSERT INTO {} ({}) SELECT {} FROM {}",
        qualified_table(&spec.schema, &spec.table_name),
        column_list,
        column_list,
        quote_ident(staged_name),
    );
    let generated = names(&spec.store_generated_columns());
    if !generated.is_empty() {
        sql.push_str(&format!(" RETURNING {}", quoted_column_list(&generated)));
    }
    sql
}

/// Set-based update joining target and staging table on primary-key
/// equality, assigning each update column from the staged value.
pub fn build_set_based_update(
    spec: &TableSpec,
    update_columns: &[&ColumnMapping],
    key_columns: &[&ColumnMapping],
    staged_name: &str,
) -> String {
    let setters = update_columns
        .iter()
        .map(|c| {
            let column = quote_ident(&c.name_in_database);
            format!("{column} = stage.{column}")
        })
        .collect::<Vec<String>>()
        .join(", ");
    let join = key_columns
        .iter()
        .map(|c| {
            let column = quote_ident(&c.name_in_database);
            format!("target.{column} = stage.{column}")
        })
        .collect::<Vec<String>>()
        .join(" AND ");
    format!(
        "UPDATE {} AS target SET {} FROM {} AS stage WHERE {}",
        qualified_table(&spec.schema, &spec.table_name),
        setters,
        quote_ident(staged_name),
        join,
    )
}

/// Filtered delete. An empty `where_sql` is the caller's explicit
/// match-all filter and produces an unfiltered statement.
pub fn build_delete(query_info: &QueryInformation) -> String {
    let table = qualified_table(&query_info.schema, &query_info.table);
    if query_info.where_sql.is_empty() {
        format!("DELETE FROM {table}")
    } else {
        format!("DELETE FROM {} {}", table, query_info.where_sql)
    }
}

/// Filtered single-column update from a structurally compiled modifier.
pub fn build_single_column_update(
    query_info: &QueryInformation,
    modifier: &CompiledModifier,
) -> String {
    let table = qualified_table(&query_info.schema, &query_info.table);
    if query_info.where_sql.is_empty() {
        format!("UPDATE {} SET {} = {}", table, modifier.column, modifier.set_sql)
    } else {
        format!(
            "UPDATE {} SET {} = {} {}",
            table, modifier.column, modifier.set_sql, query_info.where_sql
        )
    }
}

/// Upsert. Clause order is fixed: identity ON-clause, matched UPDATE,
/// not-matched INSERT. An empty effective update set becomes DO NOTHING.
pub fn build_merge(
    spec: &TableSpec,
    staged_name: &str,
    identity_columns: &[&ColumnMapping],
    update_columns: &[&ColumnMapping],
) -> String {
    let on = identity_columns
        .iter()
        .map(|c| {
            let column = quote_ident(&c.name_in_database);
            format!("target.{column} = source.{column}")
        })
        .collect::<Vec<String>>()
        .join(" AND ");

    let matched = if update_columns.is_empty() {
        "DO NOTHING".to_string()
    } else {
        let setters = update_columns
            .iter()
            .map(|c| {
                let column = quote_ident(&c.name_in_database);
                format!("{column} = source.{column}")
            })
            .collect::<Vec<String>>()
            .join(", ");
        format!("UPDATE SET {setters}")
    };

    let insertable = names(&spec.insertable_columns());
    let source_values = insertable
        .iter()
        .map(|name| format!("source.{}", quote_ident(name)))
        .collect::<Vec<String>>()
        .join(", ");

    format!(
        "MERGE INTO {} AS target USING {} AS source ON {} WHEN MATCHED THEN {} WHEN NOT MATCHED THEN INSERT ({}) VALUES ({})",
        qualified_table(&spec.schema, &spec.table_name),
        quote_ident(staged_name),
        on,
        matched,
        quoted_column_list(&insertable),
        source_values,
    )
}

/// Teardown statement for the staging table's success path.
pub fn build_drop(staged_name: &str) -> String {
    format!("DROP TABLE IF EXISTS {}", quote_ident(staged_name))
}

/// Per-row insert used by the row-by-row fallback.
pub fn build_row_insert(spec: &TableSpec) -> String {
    let insertable = names(&spec.insertable_columns());
    let placeholders: Vec<String> = (1..=insertable.len()).map(|i| format!("${i}")).collect();
    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        qualified_table(&spec.schema, &spec.table_name),
        quoted_column_list(&insertable),
        placeholders.join(", "),
    );
    let generated = names(&spec.store_generated_columns());
    if !generated.is_empty() {
        sql.push_str(&format!(" RETURNING {}", quoted_column_list(&generated)));
    }
    sql
}

/// Per-row keyed update used by the row-by-row fallback. Placeholders
/// cover the update columns first, then the key columns.
pub fn build_row_update(
    spec: &TableSpec,
    update_columns: &[&ColumnMapping],
    key_columns: &[&ColumnMapping],
) -> String {
    let mut index = 0usize;
    let setters = update_columns
        .iter()
        .map(|c| {
            index += 1;
            format!("{} = ${}", quote_ident(&c.name_in_database), index)
        })
        .collect::<Vec<String>>()
        .join(", ");
    let filter = key_columns
        .iter()
        .map(|c| {
            index += 1;
            format!("{} = ${}", quote_ident(&c.name_in_database), index)
        })
        .collect::<Vec<String>>()
        .join(" AND ");
    format!(
        "UPDATE {} SET {} WHERE {}",
        qualified_table(&spec.schema, &spec.table_name),
        setters,
        filter,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{compile_modifier, compile_predicate, Expr, ValueExpr};
    use crate::mapping::test_entities::{BlogPost, RenamedAndReorderedBlogPost};
    use crate::mapping::TableSpec;

    fn spec() -> TableSpec {
        TableSpec::resolve::<BlogPost>().unwrap()
    }

    fn renamed_spec() -> TableSpec {
        TableSpec::resolve::<RenamedAndReorderedBlogPost>().unwrap()
    }

    #[test]
    fn test_create_staging_shape() {
        let spec = spec();
        let sql = build_create_staging(&spec.insertable_columns(), "stage_blog_posts_a1b2c3d4");
        assert_eq!(
            sql,
            "CREATE TEMP TABLE \"stage_blog_posts_a1b2c3d4\" (\"title\" TEXT, \"created\" TIMESTAMPTZ, \"reads\" INTEGER)"
        );
    }

    #[test]
    fn test_copy_in_shape() {
        let spec = spec();
        let sql = build_copy_in("stage_blog_posts_a1b2c3d4", &spec.insertable_columns());
        assert_eq!(
            sql,
            "COPY \"stage_blog_posts_a1b2c3d4\" (\"title\", \"created\", \"reads\") FROM STDIN WITH (FORMAT binary)"
        );
    }

    #[test]
    fn test_values_insert_numbers_placeholders_row_major() {
        let spec = spec();
        let sql = build_values_insert("stage_blog_posts_x", &spec.insertable_columns(), 2);
        assert_eq!(
            sql,
            "INSERT INTO \"stage_blog_posts_x\" (\"title\", \"created\", \"reads\") VALUES ($1, $2, $3), ($4, $5, $6)"
        );
    }

    #[test]
    fn test_insert_select_excludes_generated_and_returns_them() {
        let sql = build_insert_select(&spec(), "stage_blog_posts_x");
        assert_eq!(
            sql,
            "INSERT INTO \"public\".\"blog_posts\" (\"title\", \"created\", \"reads\") SELECT \"title\", \"created\", \"reads\" FROM \"stage_blog_posts_x\" RETURNING \"id\""
        );
    }

    #[test]
    fn test_insert_select_without_generated_columns_has_no_returning() {
        let mut spec = spec();
        for column in &mut spec.columns {
            column.is_store_generated = false;
        }
        let sql = build_insert_select(&spec, "stage_blog_posts_x");
        assert!(sql.ends_with("FROM \"stage_blog_posts_x\""));
        assert!(!sql.contains("RETURNING"));
    }

    #[test]
    fn test_set_based_update_joins_on_keys() {
        let spec = spec();
        let sql = build_set_based_update(
            &spec,
            &spec.non_key_columns(),
            &spec.primary_key_columns(),
            "stage_blog_posts_x",
        );
        assert_eq!(
            sql,
            "UPDATE \"public\".\"blog_posts\" AS target SET \"title\" = stage.\"title\", \"created\" = stage.\"created\", \"reads\" = stage.\"reads\" FROM \"stage_blog_posts_x\" AS stage WHERE target.\"id\" = stage.\"id\""
        );
    }

    #[test]
    fn test_delete_with_filter() {
        let info = compile_predicate(&spec(), &Expr::eq("title", "T1")).unwrap();
        assert_eq!(
            build_delete(&info),
            "DELETE FROM \"public\".\"blog_posts\" WHERE \"title\" = $1"
        );
    }

    #[test]
    fn test_delete_match_all_is_unfiltered() {
        let info = compile_predicate(&spec(), &Expr::All).unwrap();
        assert_eq!(build_delete(&info), "DELETE FROM \"public\".\"blog_posts\"");
    }

    #[test]
    fn test_single_column_update_reflects_modifier_exactly() {
        let spec = spec();
        let info = compile_predicate(&spec, &Expr::gt("reads", 10)).unwrap();
        let modifier = compile_modifier(
            &spec,
            "reads",
            &ValueExpr::add(ValueExpr::column("reads"), ValueExpr::value(1)),
            info.parameters.len(),
        )
        .unwrap();
        assert_eq!(
            build_single_column_update(&info, &modifier),
            "UPDATE \"public\".\"blog_posts\" SET \"reads\" = (\"reads\" + $2) WHERE \"reads\" > $1"
        );
    }

    #[test]
    fn test_merge_clause_order_and_defaults() {
        let spec = spec();
        let sql = build_merge(
            &spec,
            "stage_blog_posts_x",
            &spec.primary_key_columns(),
            &spec.non_key_columns(),
        );
        assert_eq!(
            sql,
            "MERGE INTO \"public\".\"blog_posts\" AS target USING \"stage_blog_posts_x\" AS source ON target.\"id\" = source.\"id\" WHEN MATCHED THEN UPDATE SET \"title\" = source.\"title\", \"created\" = source.\"created\", \"reads\" = source.\"reads\" WHEN NOT MATCHED THEN INSERT (\"title\", \"created\", \"reads\") VALUES (source.\"title\", source.\"created\", source.\"reads\")"
        );
        let on = sql.find(" ON ").unwrap();
        let matched = sql.find("WHEN MATCHED").unwrap();
        let not_matched = sql.find("WHEN NOT MATCHED").unwrap();
        assert!(on < matched && matched < not_matched);
    }

    #[test]
    fn test_merge_with_restricted_update_set() {
        let spec = spec();
        let update: Vec<_> =
            spec.columns.iter().filter(|c| c.name_on_object == "reads").collect();
        let sql =
            build_merge(&spec, "stage_blog_posts_x", &spec.primary_key_columns(), &update);
        assert!(sql.contains("UPDATE SET \"reads\" = source.\"reads\" WHEN NOT MATCHED"));
        assert!(!sql.contains("\"title\" = source.\"title\""));
    }

    #[test]
    fn test_merge_with_empty_update_set_does_nothing_when_matched() {
        let spec = spec();
        let sql = build_merge(&spec, "stage_blog_posts_x", &spec.primary_key_columns(), &[]);
        assert!(sql.contains("WHEN MATCHED THEN DO NOTHING WHEN NOT MATCHED THEN INSERT"));
    }

    #[test]
    fn test_renamed_columns_reach_every_statement() {
        let spec = renamed_spec();
        let insert = build_insert_select(&spec, "stage_x");
        assert!(insert.contains("\"created2\""));
        assert!(insert.contains("\"reads2\""));
        assert!(insert.ends_with("RETURNING \"blog_id\""));
        assert!(!insert.contains("\"created\","));
        let merge = build_merge(
            &spec,
            "stage_x",
            &spec.primary_key_columns(),
            &spec.non_key_columns(),
        );
        assert!(merge.contains("target.\"blog_id\" = source.\"blog_id\""));
    }

    #[test]
    fn test_column_lists_are_name_matched_not_ordinal_matched() {
        // Reordered declaration: created before title. Every clause pairs a
        // column with itself by name, so declaration order cannot shift
        // values between columns.
        let spec = renamed_spec();
        let sql = build_set_based_update(
            &spec,
            &spec.non_key_columns(),
            &spec.primary_key_columns(),
            "stage_x",
        );
        assert!(sql.contains("\"created2\" = stage.\"created2\""));
        assert!(sql.contains("\"title\" = stage.\"title\""));
        assert!(sql.contains("\"reads2\" = stage.\"reads2\""));
    }

    #[test]
    fn test_drop_statement() {
        assert_eq!(build_drop("stage_blog_posts_x"), "DROP TABLE IF EXISTS \"stage_blog_posts_x\"");
    }

    #[test]
    fn test_row_fallback_statements() {
        let spec = spec();
        assert_eq!(
            build_row_insert(&spec),
            "INSERT INTO \"public\".\"blog_posts\" (\"title\", \"created\", \"reads\") VALUES ($1, $2, $3) RETURNING \"id\""
        );
        assert_eq!(
            build_row_update(&spec, &spec.non_key_columns(), &spec.primary_key_columns()),
            "UPDATE \"public\".\"blog_posts\" SET \"title\" = $1, \"created\" = $2, \"reads\" = $3 WHERE \"id\" = $4"
        );
    }

    #[test]
    fn test_builders_are_deterministic() {
        let spec = spec();
        let a = build_merge(&spec, "s", &spec.primary_key_columns(), &spec.non_key_columns());
        let b = build_merge(&spec, "s", &spec.primary_key_columns(), &spec.non_key_columns());
        assert_eq!(a, b);
    }
}
