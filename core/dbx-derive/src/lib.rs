//! DBX Derive — procedural macros for the DBX cluster driver.
//!
//! Provides `#[derive(Table)]` for mapping structs to table rows.

use proc_macro::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Fields, parse_macro_input};

/// Derive macro for row mapping.
///
/// # Example
///
/// ```ignore
/// #[derive(Table)]
/// #[dbx(table_name = "users")]
/// pub struct User {
///     pub id: i64,
///     #[dbx(column = "full_name")]
///     pub name: String,
///     pub email: Option<String>,
/// }
/// ```
///
/// Generates an implementation of `dbx_cluster::mapping::Mapped`:
/// - `TABLE_NAME` constant
/// - `field_names()` in declaration order
/// - `to_row()` / `from_row()` resolving columns by name
#[proc_macro_derive(Table, attributes(dbx))]
pub fn derive_table(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    let name = &input.ident;
    let table_name = extract_name_value(&input.attrs, "table_name")
        .unwrap_or_else(|| name.to_string().to_lowercase());

    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => &fields.named,
            _ => {
                return syn::Error::new_spanned(
                    name,
                    "Table can only be derived for structs with named fields",
                )
                .to_compile_error()
                .into();
            }
        },
        _ => {
            return syn::Error::new_spanned(name, "Table can only be derived for structs")
                .to_compile_error()
                .into();
        }
    };

    let idents: Vec<_> = fields.iter().filter_map(|f| f.ident.as_ref()).collect();
    let columns: Vec<String> = fields
        .iter()
        .filter_map(|f| {
            let ident = f.ident.as_ref()?;
            Some(extract_name_value(&f.attrs, "column").unwrap_or_else(|| ident.to_string()))
        })
        .collect();

    let to_row_fields = idents.iter().zip(&columns).map(|(ident, column)| {
        quote! {
            dbx_cluster::mapping::set_field(table, &mut row, #column, &self.#ident)?;
        }
    });

    let from_row_fields = idents.iter().zip(&columns).map(|(ident, column)| {
        quote! {
            #ident: dbx_cluster::mapping::field(table, row, #column)?
        }
    });

    let expanded = quote! {
        impl dbx_cluster::mapping::Mapped for #name {
            const TABLE_NAME: &'static str = #table_name;

            fn field_names() -> &'static [&'static str] {
                &[#(#columns),*]
            }

            fn to_row(
                &self,
                table: &dbx_cluster::schema::TableMetadata,
            ) -> dbx_cluster::error::DbxResult<dbx_cluster::schema::Row> {
                let mut row = dbx_cluster::schema::Row::with_columns(table.columns.len());
                #(#to_row_fields)*
                Ok(row)
            }

            fn from_row(
                table: &dbx_cluster::schema::TableMetadata,
                row: &dbx_cluster::schema::Row,
            ) -> dbx_cluster::error::DbxResult<Self> {
                Ok(Self {
                    #(#from_row_fields),*
                })
            }
        }
    };

    TokenStream::from(expanded)
}

fn extract_name_value(attrs: &[syn::Attribute], key: &str) -> Option<String> {
    for attr in attrs {
        if attr.path().is_ident("dbx")
            && let Ok(meta) = attr.parse_args::<syn::Meta>()
            && let syn::Meta::NameValue(nv) = meta
            && nv.path.is_ident(key)
            && let syn::Expr::Lit(lit) = nv.value
            && let syn::Lit::Str(s) = lit.lit
        {
            return Some(s.value());
        }
    }
    None
}
