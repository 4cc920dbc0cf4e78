//! Derive macro for fixed-layout event and job types.
//!
//! This crate provides `#[derive(Blittable)]`, which implements
//! `rgb_dispatch::Blittable` for a struct or enum. Dispatchers require
//! their event and job-state types to be flat values that can be copied
//! into worker batches without dragging shared state along.
//!
//! # What the derive records
//!
//! The derive does not reject bad fields at compile time. Instead it
//! records the first field whose type is not fixed-layout, and the
//! dispatcher refuses to construct over that type:
//!
//! ```ignore
//! #[derive(Blittable, Clone)]
//! struct Damage { amount: f32 }          // accepted
//!
//! #[derive(Blittable, Clone)]
//! struct Tagged { label: String }        // rejected at dispatcher construction
//! ```
//!
//! # Non-fixed-layout types
//!
//! - References `&T`, raw pointers, trait objects, `impl Trait`
//! - `Box<T>` / `Rc<T>` / `Arc<T>`
//! - `Vec<T>`, `VecDeque<T>`, `LinkedList<T>`, `BinaryHeap<T>`
//! - `HashMap`, `HashSet`, `BTreeMap`, `BTreeSet`
//! - `String`
//! - `Mutex<T>` / `RwLock<T>` / `Cell<T>` / `RefCell<T>`
//! - Channel `Sender` / `Receiver`
//!
//! Names are matched when written bare or under `std`, `core`, `alloc`,
//! `parking_lot`, `hashbrown` or `crossbeam_channel`. A path into any other
//! crate or module (`grid::Cell`) is checked through its own `Blittable`
//! impl. A bare name that refers to a flat type of your own can be marked
//! `#[blittable(nested)]`:
//!
//! ```ignore
//! #[derive(Blittable, Clone, Copy)]
//! struct Cell { x: i32, y: i32 }
//!
//! #[derive(Blittable, Clone, Copy)]
//! struct Moved {
//!     #[blittable(nested)]
//!     to: Cell,
//! }
//! ```
//!
//! Every other field type must itself implement `Blittable` (primitives,
//! arrays, tuples, `Option<T>`, `EntityHandle` and other derived types).
//! Type parameters are required to be `Blittable` as well.

use proc_macro::TokenStream;
use quote::{quote, quote_spanned};
use syn::{
    Attribute, Data, DeriveInput, Fields, GenericArgument, Meta, Path, PathArguments, Type,
    WherePredicate, parse_quote, spanned::Spanned,
};

/// Type names that make a field non-fixed-layout.
const FORBIDDEN_TYPES: &[&str] = &[
    "Vec",
    "VecDeque",
    "LinkedList",
    "BinaryHeap",
    "HashMap",
    "HashSet",
    "BTreeMap",
    "BTreeSet",
    "String",
    "Box",
    "Rc",
    "Arc",
    "Mutex",
    "RwLock",
    "RefCell",
    "Cell",
    "Sender",
    "Receiver",
];

/// Path prefixes under which a forbidden name still means the std type.
const KNOWN_PREFIXES: &[&str] = &[
    "std",
    "core",
    "alloc",
    "parking_lot",
    "hashbrown",
    "crossbeam_channel",
];

/// A field to validate.
struct FieldInfo<'a> {
    name: String,
    ty: &'a Type,
    nested: bool,
}

/// Outcome of inspecting one field type.
enum FieldCheck {
    /// The type is syntactically not fixed-layout; carries a short kind label.
    Forbidden(String),
    /// The type must be checked through its own `Blittable` impl.
    Nested,
}

/// Derive macro for fixed-layout types.
///
/// # Examples
///
/// ```ignore
/// #[derive(Blittable, Clone, Copy)]
/// struct Position { x: f64, y: f64, z: f64 }
/// ```
#[proc_macro_derive(Blittable, attributes(blittable))]
pub fn derive_blittable(input: TokenStream) -> TokenStream {
    let input = syn::parse_macro_input!(input as DeriveInput);
    let name = &input.ident;

    let mut fields: Vec<FieldInfo<'_>> = Vec::new();

    match &input.data {
        Data::Struct(data) => collect_fields(&data.fields, None, &mut fields),
        Data::Enum(data) => {
            for variant in &data.variants {
                collect_fields(&variant.fields, Some(&variant.ident), &mut fields);
            }
        }
        Data::Union(_) => {
            return TokenStream::from(quote_spanned! {
                input.span() =>
                compile_error!("Unions cannot derive Blittable. Use a struct or enum instead.");
            });
        }
    }

    let mut checks = Vec::with_capacity(fields.len());
    let mut generics = input.generics.clone();

    let params: Vec<syn::Ident> = generics.type_params().map(|p| p.ident.clone()).collect();
    for param in params {
        let predicate: WherePredicate = parse_quote!(#param: ::rgb_dispatch::Blittable);
        generics.make_where_clause().predicates.push(predicate);
    }

    for FieldInfo { name: field_name, ty, nested } in fields {
        let check = if nested { FieldCheck::Nested } else { check_type(ty) };
        match check {
            FieldCheck::Forbidden(kind) => {
                checks.push(quote! {
                    return ::core::option::Option::Some(::rgb_dispatch::LayoutViolation {
                        type_name: ::core::any::type_name::<Self>(),
                        field: #field_name,
                        kind: #kind,
                    });
                });
            }
            FieldCheck::Nested => {
                if !generics.params.is_empty() {
                    let predicate: WherePredicate = parse_quote!(#ty: ::rgb_dispatch::Blittable);
                    generics.make_where_clause().predicates.push(predicate);
                }
                checks.push(quote! {
                    if let ::core::option::Option::Some(violation) =
                        <#ty as ::rgb_dispatch::Blittable>::layout_violation()
                    {
                        return ::core::option::Option::Some(violation);
                    }
                });
            }
        }
    }

    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    let expanded = quote! {
        impl #impl_generics ::rgb_dispatch::Blittable for #name #ty_generics #where_clause {
            #[allow(unreachable_code)]
            fn layout_violation() -> ::core::option::Option<::rgb_dispatch::LayoutViolation> {
                #(#checks)*
                ::core::option::Option::None
            }
        }
    };

    TokenStream::from(expanded)
}

/// Check for `#[blittable(nested)]` on a field.
fn is_nested(attrs: &[Attribute]) -> bool {
    attrs.iter().any(|attr| {
        attr.path().is_ident("blittable")
            && matches!(&attr.meta, Meta::List(list) if list.tokens.to_string().trim() == "nested")
    })
}

fn collect_fields<'a>(
    fields: &'a Fields,
    variant: Option<&syn::Ident>,
    out: &mut Vec<FieldInfo<'a>>,
) {
    let prefix = variant.map(|v| format!("{v}::")).unwrap_or_default();

    match fields {
        Fields::Named(named) => {
            for field in &named.named {
                let ident = field
                    .ident
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default();
                out.push(FieldInfo {
                    name: format!("{prefix}{ident}"),
                    ty: &field.ty,
                    nested: is_nested(&field.attrs),
                });
            }
        }
        Fields::Unnamed(unnamed) => {
            for (index, field) in unnamed.unnamed.iter().enumerate() {
                out.push(FieldInfo {
                    name: format!("{prefix}{index}"),
                    ty: &field.ty,
                    nested: is_nested(&field.attrs),
                });
            }
        }
        Fields::Unit => {}
    }
}

fn check_type(ty: &Type) -> FieldCheck {
    match ty {
        Type::Path(type_path) => {
            let Some(segment) = type_path.path.segments.last() else {
                return FieldCheck::Nested;
            };
            let type_name = segment.ident.to_string();

            if names_std_type(&type_path.path) && FORBIDDEN_TYPES.contains(&type_name.as_str()) {
                return FieldCheck::Forbidden(type_name);
            }

            // Option<Box<T>> and friends are as bad as Box<T>
            if let PathArguments::AngleBracketed(args) = &segment.arguments {
                for arg in &args.args {
                    if let GenericArgument::Type(inner) = arg {
                        if let FieldCheck::Forbidden(kind) = check_type(inner) {
                            return FieldCheck::Forbidden(kind);
                        }
                    }
                }
            }

            FieldCheck::Nested
        }
        Type::Array(array) => check_type(&array.elem),
        Type::Tuple(tuple) => {
            for elem in &tuple.elems {
                if let FieldCheck::Forbidden(kind) = check_type(elem) {
                    return FieldCheck::Forbidden(kind);
                }
            }
            FieldCheck::Nested
        }
        Type::Paren(paren) => check_type(&paren.elem),
        Type::Group(group) => check_type(&group.elem),
        Type::Reference(_) => FieldCheck::Forbidden("reference".to_owned()),
        Type::Ptr(_) => FieldCheck::Forbidden("raw pointer".to_owned()),
        Type::TraitObject(_) => FieldCheck::Forbidden("trait object".to_owned()),
        Type::ImplTrait(_) => FieldCheck::Forbidden("impl Trait".to_owned()),
        Type::Slice(_) => FieldCheck::Forbidden("slice".to_owned()),
        _ => FieldCheck::Nested,
    }
}

/// Whether `path` is a bare name or lives under a known std-like crate.
fn names_std_type(path: &Path) -> bool {
    if path.segments.len() == 1 {
        return true;
    }

    path.segments
        .first()
        .is_some_and(|first| KNOWN_PREFIXES.contains(&first.ident.to_string().as_str()))
}
