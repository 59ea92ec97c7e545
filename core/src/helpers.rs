use rand::{distr::Alphanumeric, Rng};

/// Quote a resolver-derived identifier. Everything the generator emits
/// goes through here so reserved words never need special casing.
pub fn quote_ident(name: &str) -> String {
    format!("\"{name}\"")
}

/// `"schema"."table"` form used by every statement that names the target.
pub fn qualified_table(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

pub fn quoted_column_list(names: &[&str]) -> String {
    names.iter().map(|name| quote_ident(name)).collect::<Vec<String>>().join(", ")
}

pub fn generate_random_id(len: usize) -> String {
    rand::rng().sample_iter(&Alphanumeric).take(len).map(char::from).collect()
}
