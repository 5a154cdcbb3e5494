use proc_macro::TokenStream;

use quote::quote;
use syn::{
    Attribute, Expr, ExprArray, ExprLit, ItemStruct, Lit, Meta, Token, parse::Parser,
    spanned::Spanned,
};

/// Declares a pipeline phase.
///
/// ```ignore
/// #[Phase(id = "prune-patch", label = "Prune binaries and apply patches", skip = "marker", after = ["fetch"])]
/// pub struct PrunePatch;
///
/// impl PrunePatch {
///     fn run(&self, cfg: &ProjectConfig, ctx: &mut ExecCtx) -> Result<()> { .. }
/// }
/// ```
///
/// Keys: `id` and `label` (required), `skip` (`"marker"` (default), `"source-tree"`,
/// `"never"`), `after` (ids of earlier phases), `invalidates_downstream` (bool).
#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Phase(attr: TokenStream, item: TokenStream) -> TokenStream {
    match phase_impl(attr, item) {
        Ok(ts) => ts,
        Err(e) => e.to_compile_error().into(),
    }
}

fn lit_str(expr: &Expr) -> syn::Result<String> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Str(s), ..
        }) => Ok(s.value()),
        _ => Err(syn::Error::new(expr.span(), "expected string literal")),
    }
}

fn lit_bool(expr: &Expr) -> syn::Result<bool> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Bool(b), ..
        }) => Ok(b.value),
        _ => Err(syn::Error::new(expr.span(), "expected bool literal")),
    }
}

fn expr_array_strings(expr: &Expr) -> syn::Result<Vec<String>> {
    let Expr::Array(ExprArray { elems, .. }) = expr else {
        return Err(syn::Error::new(expr.span(), "expected array literal"));
    };
    elems.iter().map(lit_str).collect()
}

fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn drop_our_attrs(attrs: &[Attribute]) -> Vec<Attribute> {
    attrs
        .iter()
        .filter(|a| !a.path().is_ident("Phase"))
        .cloned()
        .collect()
}

fn phase_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = drop_our_attrs(&st.attrs);
    let struct_ident = st.ident.clone();

    let parser = syn::punctuated::Punctuated::<Meta, Token![,]>::parse_terminated;
    let metas = parser.parse(attr)?;

    let mut id: Option<String> = None;
    let mut label: Option<String> = None;
    let mut skip = String::from("marker");
    let mut after: Vec<String> = Vec::new();
    let mut invalidates_downstream = false;

    for m in metas {
        let Meta::NameValue(nv) = m else {
            return Err(syn::Error::new(m.span(), "expected key = value"));
        };
        let Some(key) = nv.path.get_ident().map(|i| i.to_string()) else {
            return Err(syn::Error::new(nv.path.span(), "expected ident key"));
        };
        let v = &nv.value;
        match key.as_str() {
            "id" => id = Some(lit_str(v)?),
            "label" => label = Some(lit_str(v)?),
            "skip" => skip = lit_str(v)?,
            "after" => after = expr_array_strings(v)?,
            "invalidates_downstream" => invalidates_downstream = lit_bool(v)?,
            other => {
                return Err(syn::Error::new(
                    nv.path.span(),
                    format!("unknown Phase attribute key '{other}'"),
                ));
            }
        }
    }

    let id = id.ok_or_else(|| syn::Error::new(struct_ident.span(), "Phase: missing id"))?;
    if !valid_id(&id) {
        return Err(syn::Error::new(
            struct_ident.span(),
            format!("Phase: id '{id}' must match [A-Za-z0-9_-]+ (it doubles as the marker key)"),
        ));
    }
    let label =
        label.ok_or_else(|| syn::Error::new(struct_ident.span(), "Phase: missing label"))?;
    if let Some(dep) = after.iter().find(|d| **d == id) {
        return Err(syn::Error::new(
            struct_ident.span(),
            format!("Phase: '{dep}' cannot run after itself"),
        ));
    }

    let skip_rule = match skip.as_str() {
        "marker" => quote! { crate::pipeline::SkipRule::Marker },
        "source-tree" => quote! { crate::pipeline::SkipRule::SourceTree },
        "never" => quote! { crate::pipeline::SkipRule::Never },
        other => {
            return Err(syn::Error::new(
                struct_ident.span(),
                format!("Phase: unknown skip rule '{other}' (marker, source-tree, never)"),
            ));
        }
    };

    let expanded = quote! {
        #st

        impl #struct_ident {
            pub const ID: &'static str = #id;
            pub const LABEL: &'static str = #label;
            pub const AFTER: &'static [&'static str] = &[#(#after),*];
        }

        impl crate::pipeline::Phase for #struct_ident {
            fn id(&self) -> &'static str {
                Self::ID
            }

            fn label(&self) -> &'static str {
                Self::LABEL
            }

            fn skip_rule(&self) -> crate::pipeline::SkipRule {
                #skip_rule
            }

            fn after(&self) -> &'static [&'static str] {
                Self::AFTER
            }

            fn invalidates_downstream(&self) -> bool {
                #invalidates_downstream
            }

            // Phases define their behavior with
            // `fn run(&self, cfg: &crate::config::ProjectConfig, ctx: &mut crate::executor::ExecCtx) -> crate::Result<()>`.
            fn execute(
                &self,
                cfg: &crate::config::ProjectConfig,
                ctx: &mut crate::executor::ExecCtx,
            ) -> crate::Result<()> {
                Self::run(self, cfg, ctx)
            }
        }
    };

    Ok(expanded.into())
}
