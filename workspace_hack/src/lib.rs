// See Cargo.toml: this crate exists only to unify feature selection for
// common dependencies across workspace members, managed by `cargo hakari`.
