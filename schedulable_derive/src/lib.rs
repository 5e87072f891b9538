use std::collections::HashSet;

use proc_macro::TokenStream;
use proc_macro2::{Span, TokenStream as TokenStream2};
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Fields, Ident, LitBool, LitStr, parse_macro_input, spanned::Spanned};

const DEFAULT_START_FIELD: &str = "published_at";
const SCHEDULED_PREDICATE: &str = "scheduled";

/// Generates validity-window predicates for a struct with timestamp fields.
///
/// ```ignore
/// #[derive(Schedulable)]
/// #[schedulable(start = "authorized_on", end = "unauthorized_on", end_required)]
/// struct Admin {
///     authorized_on: Option<DateTime<Utc>>,
///     unauthorized_on: Option<DateTime<Utc>>,
/// }
/// ```
///
/// Emits `TemporalRecord` and `Schedulable` impls plus `authorized()`,
/// `unauthorized()`, `scheduled()` and their `_as_of(now)` forms. Without a
/// `#[schedulable]` attribute the window starts at `published_at` and has no end.
#[proc_macro_derive(Schedulable, attributes(schedulable))]
pub fn derive_schedulable(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand_schedulable(input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

struct WindowOptions {
    span: Span,
    start: String,
    end: Option<String>,
    end_required: bool,
}

fn expand_schedulable(input: DeriveInput) -> syn::Result<TokenStream2> {
    let struct_name = input.ident;

    if !input.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            input.generics,
            "Schedulable does not support generic structs",
        ));
    }

    let data_struct = match input.data {
        Data::Struct(data) => data,
        _ => {
            return Err(syn::Error::new(
                struct_name.span(),
                "Schedulable can only be derived for structs",
            ));
        }
    };

    let named_fields = match data_struct.fields {
        Fields::Named(fields) => fields,
        _ => {
            return Err(syn::Error::new(
                struct_name.span(),
                "Schedulable requires named fields",
            ));
        }
    };

    let field_names: HashSet<String> = named_fields
        .named
        .iter()
        .filter_map(|field| field.ident.as_ref().map(|ident| ident.to_string()))
        .collect();

    let mut windows = parse_window_options(&input.attrs)?;
    if windows.is_empty() {
        windows.push(WindowOptions {
            span: struct_name.span(),
            start: DEFAULT_START_FIELD.to_string(),
            end: None,
            end_required: false,
        });
    }

    validate_windows(&windows, &field_names)?;

    let mut boundary_fields = Vec::<String>::new();
    for window in &windows {
        for field in std::iter::once(&window.start).chain(window.end.as_ref()) {
            if !boundary_fields.contains(field) {
                boundary_fields.push(field.clone());
            }
        }
    }
    let boundary_idents = boundary_fields
        .iter()
        .map(|field| format_ident!("{}", field))
        .collect::<Vec<_>>();

    let config_exprs = windows.iter().map(|window| {
        let start = &window.start;
        let end_call = window.end.as_ref().map(|end| quote!(.end(#end)));
        let end_required = window.end_required;
        quote! {
            ::schedulable::ValidityConfig::builder()
                .start(#start)
                #end_call
                .end_required(#end_required)
                .build()
                .unwrap_or_else(|err| {
                    panic!("invalid #[schedulable] window on {}: {}", stringify!(#struct_name), err)
                })
        }
    });

    let mut predicate_methods = Vec::<TokenStream2>::new();
    for (index, window) in windows.iter().enumerate() {
        predicate_methods.push(window_methods(window, index == 0)?);
    }

    Ok(quote! {
        impl ::schedulable::TemporalRecord for #struct_name {
            fn instant(
                &self,
                field: &str,
            ) -> ::schedulable::Result<
                ::core::option::Option<::schedulable::chrono::DateTime<::schedulable::chrono::Utc>>,
            > {
                match field {
                    #(
                        #boundary_fields => ::core::result::Result::Ok(
                            ::schedulable::AsInstant::as_instant(&self.#boundary_idents),
                        ),
                    )*
                    other => ::core::result::Result::Err(
                        ::schedulable::ValidityError::FieldNotFound(other.to_string()),
                    ),
                }
            }
        }

        impl ::schedulable::Schedulable for #struct_name {
            fn validity_configs() -> &'static [::schedulable::ValidityConfig] {
                static CONFIGS: ::std::sync::OnceLock<::std::vec::Vec<::schedulable::ValidityConfig>> =
                    ::std::sync::OnceLock::new();
                CONFIGS.get_or_init(|| ::std::vec![#(#config_exprs),*])
            }
        }

        impl #struct_name {
            #(#predicate_methods)*
        }
    })
}

fn window_methods(window: &WindowOptions, primary: bool) -> syn::Result<TokenStream2> {
    let start_ident = format_ident!("{}", window.start);
    let start_expr = quote!(::schedulable::AsInstant::as_instant(&self.#start_ident));
    let end_expr = match &window.end {
        Some(end) => {
            let end_ident = format_ident!("{}", end);
            quote!(::schedulable::AsInstant::as_instant(&self.#end_ident))
        }
        None => quote!(::core::option::Option::None),
    };

    let now_ty = quote!(::schedulable::chrono::DateTime<::schedulable::chrono::Utc>);
    let window_expr = quote!(::schedulable::Window::new(#start_expr, #end_expr));

    let active = method_ident(&predicate_name(&window.start), window.span)?;
    let active_as_of = format_ident!("{}_as_of", active);
    let mut tokens = quote! {
        #[allow(non_snake_case)]
        pub fn #active(&self) -> bool {
            self.#active_as_of(::schedulable::chrono::Utc::now())
        }

        #[allow(non_snake_case)]
        pub fn #active_as_of(&self, now: #now_ty) -> bool {
            #window_expr.is_active(now)
        }
    };

    if let Some(end) = &window.end {
        let expired = method_ident(&predicate_name(end), window.span)?;
        let expired_as_of = format_ident!("{}_as_of", expired);
        tokens.extend(quote! {
            #[allow(non_snake_case)]
            pub fn #expired(&self) -> bool {
                self.#expired_as_of(::schedulable::chrono::Utc::now())
            }

            #[allow(non_snake_case)]
            pub fn #expired_as_of(&self, now: #now_ty) -> bool {
                #window_expr.is_expired(now)
            }
        });
    }

    if primary {
        tokens.extend(quote! {
            pub fn scheduled(&self) -> bool {
                self.scheduled_as_of(::schedulable::chrono::Utc::now())
            }

            pub fn scheduled_as_of(&self, now: #now_ty) -> bool {
                #window_expr.is_scheduled(::schedulable::BoundaryKind::Start, now)
            }
        });
    }

    Ok(tokens)
}

fn validate_windows(windows: &[WindowOptions], field_names: &HashSet<String>) -> syn::Result<()> {
    let mut starts = HashSet::new();
    let mut methods = HashSet::new();
    methods.insert(SCHEDULED_PREDICATE.to_string());
    methods.insert(format!("{}_as_of", SCHEDULED_PREDICATE));

    for window in windows {
        if window.end_required && window.end.is_none() {
            return Err(syn::Error::new(
                window.span,
                "#[schedulable(end_required)] needs an end field: add end = \"...\"",
            ));
        }

        if window.end.as_deref() == Some(window.start.as_str()) {
            return Err(syn::Error::new(
                window.span,
                "#[schedulable] start and end must be different fields",
            ));
        }

        for field in std::iter::once(&window.start).chain(window.end.as_ref()) {
            if !field_names.contains(field) {
                return Err(syn::Error::new(
                    window.span,
                    format!("#[schedulable] refers to unknown field `{}`", field),
                ));
            }
        }

        if !starts.insert(window.start.clone()) {
            return Err(syn::Error::new(
                window.span,
                format!("duplicate #[schedulable] window starting at `{}`", window.start),
            ));
        }

        let mut generated = vec![predicate_name(&window.start)];
        generated.extend(window.end.as_deref().map(predicate_name));
        let generated = generated
            .into_iter()
            .flat_map(|name| [format!("{}_as_of", name), name]);
        for name in generated {
            if !methods.insert(name.clone()) {
                return Err(syn::Error::new(
                    window.span,
                    format!("#[schedulable] predicate `{}` is generated twice", name),
                ));
            }
        }
    }

    Ok(())
}

fn parse_window_options(attrs: &[syn::Attribute]) -> syn::Result<Vec<WindowOptions>> {
    let mut windows = Vec::new();

    for attr in attrs {
        if !attr.path().is_ident("schedulable") {
            continue;
        }

        let mut window = WindowOptions {
            span: attr.span(),
            start: DEFAULT_START_FIELD.to_string(),
            end: None,
            end_required: false,
        };

        if let syn::Meta::List(_) = &attr.meta {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("start") {
                    let value = meta.value()?;
                    let lit: LitStr = value.parse()?;
                    window.start = lit.value();
                    return Ok(());
                }

                if meta.path.is_ident("end") {
                    let value = meta.value()?;
                    let lit: LitStr = value.parse()?;
                    window.end = Some(lit.value());
                    return Ok(());
                }

                if meta.path.is_ident("end_required") {
                    window.end_required = if meta.input.peek(syn::Token![=]) {
                        let lit: LitBool = meta.value()?.parse()?;
                        lit.value
                    } else {
                        true
                    };
                    return Ok(());
                }

                Err(meta.error(
                    "Unsupported #[schedulable] option. Supported: start = \"...\", end = \"...\", end_required",
                ))
            })?;
        }

        windows.push(window);
    }

    Ok(windows)
}

fn method_ident(name: &str, span: Span) -> syn::Result<Ident> {
    syn::parse_str::<Ident>(name).map_err(|_| {
        syn::Error::new(
            span,
            format!("#[schedulable] cannot generate a predicate named `{}`", name),
        )
    })
}

// Mirrors `schedulable::validity::predicate_name`.
fn predicate_name(field: &str) -> String {
    for suffix in ["_at", "_on"] {
        if let Some(stem) = field.strip_suffix(suffix)
            && !stem.is_empty()
        {
            return stem.to_string();
        }
    }

    for suffix in ["At", "On"] {
        if let Some(stem) = field.strip_suffix(suffix)
            && stem.chars().last().is_some_and(|c| c.is_lowercase() || c.is_ascii_digit())
        {
            return stem.to_string();
        }
    }

    field.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(start: &str, end: Option<&str>) -> WindowOptions {
        WindowOptions {
            span: Span::call_site(),
            start: start.to_string(),
            end: end.map(str::to_string),
            end_required: false,
        }
    }

    fn fields(names: &[&str]) -> HashSet<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn test_predicate_name() {
        assert_eq!(predicate_name("published_at"), "published");
        assert_eq!(predicate_name("authorized_on"), "authorized");
        assert_eq!(predicate_name("startsAt"), "starts");
        assert_eq!(predicate_name("_at"), "_at");
        assert_eq!(predicate_name("status"), "status");
    }

    #[test]
    fn test_as_of_methods_count_as_generated_names() {
        let all = fields(&["published_at", "published_as_of_at"]);
        let err = validate_windows(
            &[window("published_at", Some("published_as_of_at"))],
            &all,
        )
        .unwrap_err();
        assert!(err.to_string().contains("`published_as_of`"));

        let err = validate_windows(
            &[
                window("published_at", None),
                window("published_as_of_at", None),
            ],
            &all,
        )
        .unwrap_err();
        assert!(err.to_string().contains("generated twice"));

        let scheduled = fields(&["scheduled_as_of_at"]);
        assert!(validate_windows(&[window("scheduled_as_of_at", None)], &scheduled).is_err());
    }

    #[test]
    fn test_independent_windows_pass() {
        let all = fields(&["opens_at", "closes_at", "startsAt", "endsAt"]);
        assert!(
            validate_windows(
                &[
                    window("opens_at", Some("closes_at")),
                    window("startsAt", Some("endsAt")),
                ],
                &all,
            )
            .is_ok()
        );
    }

    #[test]
    fn test_end_required_needs_end_field() {
        let mut options = window("published_at", None);
        options.end_required = true;
        assert!(validate_windows(&[options], &fields(&["published_at"])).is_err());
    }
}
