//! Cache key composition.
//!
//! Keys come in two layers. A *base key* names a logical resource
//! (`namespace-operation`, optionally suffixed with `[extension]`) and scopes
//! invalidation. A *variant key* extends the base key with the request's
//! parameters and representation tag and identifies one stored response:
//!
//! ```text
//! feeds-getrssfeed[33]:feedid=33&page=2:application/json
//! \__ base key ______/ \__ params ___/ \_ representation
//! ```
//!
//! Every key is lower-cased, so composition is case-insensitive. Names and
//! values are escaped (`%`, `&`, `=`) before they are joined, so a value can
//! never pass for a separator.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use super::error::CacheError;

/// Suffix of the sibling entry holding a variant's content type.
pub const CONTENT_TYPE_SUFFIX: &str = ":contenttype";
/// Suffix of the sibling entry holding a variant's fingerprint.
pub const ETAG_SUFFIX: &str = ":etag";
/// Query parameter reserved for JSONP callback negotiation.
pub const DEFAULT_CALLBACK_PARAM: &str = "callback";

/// Logical endpoint, independent of the arguments it is called with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceIdentity {
    namespace: String,
    operation: String,
}

impl ResourceIdentity {
    pub fn new(namespace: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            operation: operation.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    fn validate(&self) -> Result<(), CacheError> {
        if self.namespace.trim().is_empty() {
            return Err(CacheError::invalid_key_context("namespace"));
        }
        if self.operation.trim().is_empty() {
            return Err(CacheError::invalid_key_context("operation"));
        }
        Ok(())
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.operation)
    }
}

/// Implemented by argument types that know how to describe themselves in a
/// base key.
///
/// A self-describing argument takes precedence over any named extension
/// arguments: when one is present, its contribution alone becomes the base
/// key extension.
pub trait CacheKeySource: Send + Sync {
    fn cache_key(&self) -> String;
}

/// An operation argument as seen by the key builder.
#[derive(Clone)]
pub enum ArgValue {
    Null,
    Text(String),
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
    List(Vec<ArgValue>),
    Keyed(Arc<dyn CacheKeySource>),
}

impl ArgValue {
    pub fn keyed(source: impl CacheKeySource + 'static) -> Self {
        Self::Keyed(Arc::new(source))
    }

    /// String form used in keys. `Null` has none; lists render as
    /// `"a;b;c;"`.
    pub fn to_key_string(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Text(value) => Some(value.clone()),
            Self::Int(value) => Some(value.to_string()),
            Self::UInt(value) => Some(value.to_string()),
            Self::Float(value) => Some(value.to_string()),
            Self::Bool(value) => Some(value.to_string()),
            Self::List(items) => Some(items.iter().fold(String::new(), |mut acc, item| {
                if let Some(value) = item.to_key_string() {
                    acc.push_str(&value);
                }
                acc.push(';');
                acc
            })),
            Self::Keyed(source) => Some(source.cache_key()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl fmt::Debug for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("Null"),
            Self::Text(value) => f.debug_tuple("Text").field(value).finish(),
            Self::Int(value) => f.debug_tuple("Int").field(value).finish(),
            Self::UInt(value) => f.debug_tuple("UInt").field(value).finish(),
            Self::Float(value) => f.debug_tuple("Float").field(value).finish(),
            Self::Bool(value) => f.debug_tuple("Bool").field(value).finish(),
            Self::List(items) => f.debug_tuple("List").field(items).finish(),
            Self::Keyed(source) => f.debug_tuple("Keyed").field(&source.cache_key()).finish(),
        }
    }
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i32> for ArgValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<i64> for ArgValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for ArgValue {
    fn from(value: u32) -> Self {
        Self::UInt(u64::from(value))
    }
}

impl From<u64> for ArgValue {
    fn from(value: u64) -> Self {
        Self::UInt(value)
    }
}

impl From<f64> for ArgValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for ArgValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl<T: Into<ArgValue>> From<Option<T>> for ArgValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl<T: Into<ArgValue>> From<Vec<T>> for ArgValue {
    fn from(values: Vec<T>) -> Self {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

/// Operation arguments in declaration order.
#[derive(Debug, Clone, Default)]
pub struct ArgumentMap {
    entries: Vec<(String, ArgValue)>,
}

impl ArgumentMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.insert(name, value);
        self
    }

    /// Insert an argument, replacing an existing one of the same name in place.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<ArgValue>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ArgValue> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArgValue)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `name=value` pairs for every non-null argument.
    pub fn key_pairs(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .filter_map(|(name, value)| value.to_key_string().map(|v| (name.clone(), v)))
            .collect()
    }

    fn self_describing(&self) -> Option<String> {
        self.entries.iter().find_map(|(_, value)| match value {
            ArgValue::Keyed(source) => Some(source.cache_key()),
            _ => None,
        })
    }
}

impl<N, V> FromIterator<(N, V)> for ArgumentMap
where
    N: Into<String>,
    V: Into<ArgValue>,
{
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (name, value) in iter {
            map.insert(name, value);
        }
        map
    }
}

/// The request attributes that select one cached variant of a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VarianceDescriptor {
    pub arguments: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub representation: Option<String>,
}

impl VarianceDescriptor {
    pub fn new(
        arguments: Vec<(String, String)>,
        query: Vec<(String, String)>,
        representation: Option<String>,
    ) -> Self {
        Self {
            arguments,
            query,
            representation,
        }
    }

    /// Ordered, de-duplicated `name=value` segments joined with `&`.
    ///
    /// Arguments come first, then query pairs unless `exclude_query` is set.
    /// Only exactly equal pairs collapse. Pairs named `callback_param` are
    /// dropped from both sources.
    pub fn params(&self, exclude_query: bool, callback_param: &str) -> String {
        let query: &[(String, String)] = if exclude_query { &[] } else { &self.query };

        let mut pairs: Vec<(&str, &str)> = Vec::with_capacity(self.arguments.len() + query.len());
        for (name, value) in self.arguments.iter().chain(query) {
            if name.eq_ignore_ascii_case(callback_param) {
                continue;
            }
            let pair = (name.as_str(), value.as_str());
            if !pairs.contains(&pair) {
                pairs.push(pair);
            }
        }

        pairs
            .into_iter()
            .map(|(name, value)| format!("{}={}", escape_component(name), escape_component(value)))
            .collect::<Vec<_>>()
            .join("&")
    }
}

fn escape_component(text: &str) -> Cow<'_, str> {
    if !text.contains(['%', '&', '=']) {
        return Cow::Borrowed(text);
    }
    let mut escaped = String::with_capacity(text.len() + 4);
    for ch in text.chars() {
        match ch {
            '%' => escaped.push_str("%25"),
            '&' => escaped.push_str("%26"),
            '=' => escaped.push_str("%3D"),
            _ => escaped.push(ch),
        }
    }
    Cow::Owned(escaped)
}

/// Compose a base key: `namespace-operation` or `namespace-operation[extension]`.
pub fn base_key(
    identity: &ResourceIdentity,
    extension: Option<&str>,
) -> Result<String, CacheError> {
    identity.validate()?;
    let key = match extension.filter(|ext| !ext.is_empty()) {
        Some(ext) => format!("{}-{}[{}]", identity.namespace, identity.operation, ext),
        None => format!("{}-{}", identity.namespace, identity.operation),
    };
    Ok(key.to_lowercase())
}

/// Compose a base key whose extension is derived from the operation's
/// arguments. See [`extension_from_args`].
pub fn base_key_from_args(
    identity: &ResourceIdentity,
    arguments: &ArgumentMap,
    extension_args: &[String],
) -> Result<String, CacheError> {
    let extension = extension_from_args(arguments, extension_args);
    base_key(identity, extension.as_deref())
}

/// Derive a base key extension from arguments.
///
/// The first self-describing argument wins outright. Otherwise every name in
/// `extension_args` with a non-empty value contributes `name=value`, joined
/// with `&` in the order given.
pub fn extension_from_args(arguments: &ArgumentMap, extension_args: &[String]) -> Option<String> {
    if let Some(contribution) = arguments.self_describing() {
        return Some(contribution);
    }

    let segments: Vec<String> = extension_args
        .iter()
        .filter_map(|name| {
            let value = arguments.get(name)?.to_key_string()?;
            (!value.is_empty())
                .then(|| format!("{}={}", escape_component(name), escape_component(&value)))
        })
        .collect();

    (!segments.is_empty()).then(|| segments.join("&"))
}

/// Compose a variant key: `base:params:representation`, lower-cased.
pub fn variant_key(
    base_key: &str,
    variance: &VarianceDescriptor,
    exclude_query: bool,
    callback_param: &str,
) -> Result<String, CacheError> {
    if base_key.is_empty() {
        return Err(CacheError::invalid_key_context("base_key"));
    }
    let params = variance.params(exclude_query, callback_param);
    let representation = variance.representation.as_deref().unwrap_or_default();
    Ok(format!("{base_key}:{params}:{representation}").to_lowercase())
}

/// Chooses the variant key a response is stored under.
///
/// The base key is always derived from the resource identity so invalidation
/// can find it; a generator decides everything that follows. Keys it returns
/// are lower-cased by the engine.
pub trait KeyGenerator: Send + Sync {
    fn variant_key(
        &self,
        base_key: &str,
        variance: &VarianceDescriptor,
        exclude_query: bool,
        callback_param: &str,
    ) -> Result<String, CacheError>;
}

/// `base:params:representation`, see [`variant_key`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultKeyGenerator;

impl KeyGenerator for DefaultKeyGenerator {
    fn variant_key(
        &self,
        base_key: &str,
        variance: &VarianceDescriptor,
        exclude_query: bool,
        callback_param: &str,
    ) -> Result<String, CacheError> {
        variant_key(base_key, variance, exclude_query, callback_param)
    }
}

pub fn content_type_key(variant_key: &str) -> String {
    format!("{variant_key}{CONTENT_TYPE_SUFFIX}")
}

pub fn etag_key(variant_key: &str) -> String {
    format!("{variant_key}{ETAG_SUFFIX}")
}

/// Keys of the sibling entries owned by `key`.
pub fn sibling_keys(key: &str) -> [String; 2] {
    [content_type_key(key), etag_key(key)]
}

/// The representation tag embedded in a variant key, if any.
pub fn representation_segment(variant_key: &str) -> Option<&str> {
    variant_key
        .rsplit_once(':')
        .map(|(_, tag)| tag)
        .filter(|tag| !tag.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FeedQuery {
        id: u32,
        locale: &'static str,
    }

    impl CacheKeySource for FeedQuery {
        fn cache_key(&self) -> String {
            format!("{}-{}", self.id, self.locale)
        }
    }

    fn feeds() -> ResourceIdentity {
        ResourceIdentity::new("Feeds", "GetRSSFeed")
    }

    #[test]
    fn base_key_without_extension() {
        assert_eq!(base_key(&feeds(), None).unwrap(), "feeds-getrssfeed");
    }

    #[test]
    fn base_key_with_extension() {
        assert_eq!(
            base_key(&feeds(), Some("33")).unwrap(),
            "feeds-getrssfeed[33]"
        );
    }

    #[test]
    fn empty_extension_has_no_brackets() {
        assert_eq!(base_key(&feeds(), Some("")).unwrap(), "feeds-getrssfeed");
    }

    #[test]
    fn empty_identity_fields_are_rejected() {
        let err = base_key(&ResourceIdentity::new("", "Get"), None).unwrap_err();
        assert_eq!(err, CacheError::invalid_key_context("namespace"));

        let err = base_key(&ResourceIdentity::new("Feeds", "  "), None).unwrap_err();
        assert_eq!(err, CacheError::invalid_key_context("operation"));
    }

    #[test]
    fn key_string_of_values() {
        assert_eq!(ArgValue::Null.to_key_string(), None);
        assert_eq!(
            ArgValue::from(vec![1, 2, 3]).to_key_string().as_deref(),
            Some("1;2;3;")
        );
        assert_eq!(
            ArgValue::List(vec![ArgValue::from("a"), ArgValue::Null]).to_key_string().as_deref(),
            Some("a;;")
        );
        assert_eq!(ArgValue::from(true).to_key_string().as_deref(), Some("true"));
        assert_eq!(ArgValue::from(None::<u32>).to_key_string(), None);
    }

    #[test]
    fn named_args_build_extension_in_given_order() {
        let args = ArgumentMap::new()
            .with("feedId", 33)
            .with("page", 2)
            .with("missing", ArgValue::Null);

        let key = base_key_from_args(
            &feeds(),
            &args,
            &[
                "page".to_string(),
                "absent".to_string(),
                "missing".to_string(),
                "feedId".to_string(),
            ],
        )
        .unwrap();

        assert_eq!(key, "feeds-getrssfeed[page=2&feedid=33]");
    }

    #[test]
    fn no_matching_named_args_means_no_extension() {
        let args = ArgumentMap::new().with("feedId", ArgValue::Null);
        let key = base_key_from_args(&feeds(), &args, &["feedId".to_string()]).unwrap();
        assert_eq!(key, "feeds-getrssfeed");
    }

    #[test]
    fn self_describing_argument_overrides_named_args() {
        let args = ArgumentMap::new()
            .with("feedId", 33)
            .with("query", ArgValue::keyed(FeedQuery { id: 7, locale: "EN" }))
            .with("other", ArgValue::keyed(FeedQuery { id: 8, locale: "de" }));

        let key = base_key_from_args(&feeds(), &args, &["feedId".to_string()]).unwrap();
        assert_eq!(key, "feeds-getrssfeed[7-en]");
    }

    #[test]
    fn variant_key_from_arguments() {
        let base = base_key(&feeds(), None).unwrap();
        let args = ArgumentMap::new().with("feedId", 33);
        let variance =
            VarianceDescriptor::new(args.key_pairs(), Vec::new(), Some("application/json".into()));

        let key = variant_key(&base, &variance, false, DEFAULT_CALLBACK_PARAM).unwrap();
        assert_eq!(key, "feeds-getrssfeed:feedid=33:application/json");
    }

    #[test]
    fn variant_key_unions_query_without_duplicates() {
        let variance = VarianceDescriptor::new(
            vec![("feedId".into(), "33".into())],
            vec![("feedId".into(), "33".into()), ("page".into(), "2".into())],
            Some("text/xml".into()),
        );

        let key =
            variant_key("feeds-getrssfeed", &variance, false, DEFAULT_CALLBACK_PARAM).unwrap();
        assert_eq!(key, "feeds-getrssfeed:feedid=33&page=2:text/xml");
    }

    #[test]
    fn only_identical_pairs_collapse() {
        let variance = VarianceDescriptor::new(
            vec![("feedId".into(), "33".into())],
            vec![("feedid".into(), "33".into())],
            None,
        );

        assert_eq!(variance.params(false, DEFAULT_CALLBACK_PARAM), "feedId=33&feedid=33");
    }

    #[test]
    fn separators_inside_values_are_escaped() {
        let encoded = VarianceDescriptor::new(
            Vec::new(),
            vec![("q".into(), "a&b=1".into())],
            None,
        );
        let split = VarianceDescriptor::new(
            Vec::new(),
            vec![("q".into(), "a".into()), ("b".into(), "1".into())],
            None,
        );

        let encoded = variant_key("search-find", &encoded, false, DEFAULT_CALLBACK_PARAM).unwrap();
        let split = variant_key("search-find", &split, false, DEFAULT_CALLBACK_PARAM).unwrap();

        assert_eq!(encoded, "search-find:q=a%26b%3d1:");
        assert_eq!(split, "search-find:q=a&b=1:");

        let percent = VarianceDescriptor::new(Vec::new(), vec![("q".into(), "100%".into())], None);
        assert_eq!(percent.params(false, DEFAULT_CALLBACK_PARAM), "q=100%25");
    }

    #[test]
    fn variant_key_can_ignore_query() {
        let variance = VarianceDescriptor::new(
            vec![("feedId".into(), "33".into())],
            vec![("page".into(), "2".into())],
            Some("text/xml".into()),
        );

        let key = variant_key("feeds-getrssfeed", &variance, true, DEFAULT_CALLBACK_PARAM).unwrap();
        assert_eq!(key, "feeds-getrssfeed:feedid=33:text/xml");
    }

    #[test]
    fn callback_param_never_leaves_dangling_separators() {
        for query in [
            vec![("callback", "cb"), ("page", "2")],
            vec![("page", "2"), ("Callback", "cb")],
            vec![("page", "2"), ("CALLBACK", "cb"), ("sort", "asc")],
        ] {
            let query = query
                .into_iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect();
            let variance = VarianceDescriptor::new(Vec::new(), query, None);
            let key = variant_key("feeds-list", &variance, false, DEFAULT_CALLBACK_PARAM).unwrap();

            assert!(!key.contains("callback"), "{key}");
            assert!(!key.contains("&&"), "{key}");
            assert!(!key.contains(":&") && !key.contains("&:"), "{key}");
        }
    }

    #[test]
    fn only_callback_yields_empty_params() {
        let variance = VarianceDescriptor::new(
            Vec::new(),
            vec![("callback".into(), "jsonp1".into())],
            Some("application/javascript".into()),
        );
        let key = variant_key("feeds-list", &variance, false, DEFAULT_CALLBACK_PARAM).unwrap();
        assert_eq!(key, "feeds-list::application/javascript");
    }

    #[test]
    fn variant_key_requires_base_key() {
        let err = variant_key("", &VarianceDescriptor::default(), false, DEFAULT_CALLBACK_PARAM)
            .unwrap_err();
        assert_eq!(err, CacheError::invalid_key_context("base_key"));
    }

    #[test]
    fn composition_is_case_insensitive() {
        let upper = base_key(&ResourceIdentity::new("FEEDS", "GETRSSFEED"), Some("ID=33")).unwrap();
        let lower = base_key(&ResourceIdentity::new("feeds", "getrssfeed"), Some("id=33")).unwrap();
        assert_eq!(upper, lower);
    }

    #[test]
    fn sibling_keys_extend_the_variant() {
        let key = "feeds-getrssfeed:feedid=33:application/json";
        let [content_type, etag] = sibling_keys(key);
        assert_eq!(content_type, format!("{key}:contenttype"));
        assert_eq!(etag, format!("{key}:etag"));
        assert_eq!(representation_segment(key), Some("application/json"));
        assert_eq!(representation_segment("feeds-list::"), None);
    }

    #[test]
    fn argument_map_replaces_in_place() {
        let mut args: ArgumentMap = [("a", 1), ("b", 2)].into_iter().collect();
        args.insert("a", 3);
        let names: Vec<&str> = args.iter().map(|(name, _)| name).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(args.get("a").and_then(ArgValue::to_key_string).as_deref(), Some("3"));
    }
}
