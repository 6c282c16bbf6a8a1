//! Dotted-path addressing and predicate queries over [`Object`] trees.
//!
//! Paths are dot-separated components; integer components index arrays and
//! string components index dictionaries (`"array.0"`, `"a.b.2.c"`).
//! [`fmt_iter`] evaluates predicate templates against the elements of an
//! array, with optional offset/limit/reverse/sort/single/count parameters.

use std::cmp::Ordering;

use crate::error::{Result, RpcError};
use crate::object::{Object, Tag};

/// Parameters applied to a [`fmt_iter`] evaluation.
///
/// The pipeline order is: array order (reversed when `reverse`), stable sort
/// by the `sort` key, then `offset`/`limit`, then `single`/`count`.
#[derive(Clone, Debug, Default)]
pub struct QueryParams {
    pub offset: usize,
    pub limit: Option<usize>,
    pub reverse: bool,
    /// Dotted-path key to stable-sort matches by.
    pub sort: Option<String>,
    /// Yield the first match only.
    pub single: bool,
    /// Yield a single uint64 holding the number of matches.
    pub count: bool,
}

fn components(path: &str) -> Vec<&str> {
    path.split('.').filter(|c| !c.is_empty()).collect()
}

fn child(obj: &Object, comp: &str) -> Option<Object> {
    match obj.tag() {
        Tag::Array => comp.parse::<usize>().ok().and_then(|idx| obj.get_index(idx)),
        Tag::Dictionary => obj.get_key(comp),
        _ => None,
    }
}

fn descend(root: &Object, comps: &[&str]) -> Option<Object> {
    let mut cur = root.clone();
    for comp in comps {
        cur = child(&cur, comp)?;
    }
    Some(cur)
}

/// Return the Object addressed by `path`, or `default`. Never mutates.
pub fn get(root: &Object, path: &str, default: Option<Object>) -> Option<Object> {
    descend(root, &components(path)).or(default)
}

/// Whether `path` addresses an existing entry.
pub fn contains(root: &Object, path: &str) -> bool {
    descend(root, &components(path)).is_some()
}

fn attach(container: &Object, comp: &str, value: Object) -> Result<()> {
    match container.tag() {
        Tag::Array => {
            let idx: usize = comp.parse().map_err(|_| {
                RpcError::invalid_arguments(format!(
                    "path component {:?} does not index an array",
                    comp
                ))
            })?;
            while container.len()? < idx {
                container.append(Object::null())?;
            }
            container.set_index(idx, value)
        }
        Tag::Dictionary => container.set_key(comp, value),
        tag => Err(RpcError::invalid_arguments(format!(
            "path component {:?} addresses a {} value, not a container",
            comp, tag
        ))),
    }
}

/// Store `value` at `path`.
///
/// With `create_missing`, absent intermediate levels are materialised: a
/// component that parses as an integer creates an array, anything else a
/// dictionary.
pub fn set(root: &Object, path: &str, value: Object, create_missing: bool) -> Result<()> {
    let comps = components(path);
    let Some((last, parents)) = comps.split_last() else {
        return Err(RpcError::invalid_arguments("empty query path"));
    };

    let mut cur = root.clone();
    for (idx, comp) in parents.iter().enumerate() {
        match child(&cur, comp) {
            Some(next) => cur = next,
            None => {
                if !create_missing {
                    return Err(RpcError::not_found(format!(
                        "path {:?} has no entry {:?}",
                        path, comp
                    )));
                }
                let next_comp = comps[idx + 1];
                let fresh = if next_comp.parse::<usize>().is_ok() {
                    Object::array(Vec::new())
                } else {
                    Object::dictionary()
                };
                attach(&cur, comp, fresh.clone())?;
                cur = fresh;
            }
        }
    }

    attach(&cur, last, value)
}

/// Remove the entry at `path`. Deleting from an array shifts subsequent
/// indices left.
pub fn delete(root: &Object, path: &str) -> Result<()> {
    let comps = components(path);
    let Some((last, parents)) = comps.split_last() else {
        return Err(RpcError::invalid_arguments("empty query path"));
    };

    let parent = descend(root, parents)
        .ok_or_else(|| RpcError::not_found(format!("path {:?} does not exist", path)))?;

    match parent.tag() {
        Tag::Array => {
            let idx: usize = last
                .parse()
                .map_err(|_| RpcError::not_found(format!("path {:?} does not exist", path)))?;
            parent
                .remove_index(idx)
                .map_err(|_| RpcError::not_found(format!("path {:?} does not exist", path)))?;
            Ok(())
        }
        Tag::Dictionary => match parent.remove_key(last)? {
            Some(_) => Ok(()),
            None => Err(RpcError::not_found(format!(
                "path {:?} does not exist",
                path
            ))),
        },
        _ => Err(RpcError::not_found(format!("path {:?} does not exist", path))),
    }
}

enum CompiledOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Regex(regex::Regex),
    In,
    Nin,
    Contains,
    Match(glob::Pattern),
}

struct Clause {
    path: String,
    op: CompiledOp,
    value: Object,
}

struct Predicate {
    clauses: Vec<Clause>,
}

impl Predicate {
    fn compile(template: &Object) -> Result<Predicate> {
        if template.is_null() {
            return Ok(Predicate { clauses: Vec::new() });
        }

        let mut clauses = Vec::new();
        for triple in template.array_iter()? {
            let triple = triple?;
            if triple.tag() != Tag::Array || triple.len()? != 3 {
                return Err(RpcError::invalid_arguments(
                    "predicate clauses must be [key, operator, value] triples",
                ));
            }
            let field = |idx: usize| triple.get_index(idx).unwrap_or_else(Object::null);
            let path = field(0).as_str()?.to_owned();
            let op_name = field(1).as_str()?.to_owned();
            let value = field(2);

            let op = match op_name.as_str() {
                "=" => CompiledOp::Eq,
                "!=" => CompiledOp::Ne,
                ">" => CompiledOp::Gt,
                ">=" => CompiledOp::Ge,
                "<" => CompiledOp::Lt,
                "<=" => CompiledOp::Le,
                "~" => CompiledOp::Regex(regex::Regex::new(value.as_str()?).map_err(|e| {
                    RpcError::invalid_arguments(format!("invalid regex predicate: {}", e))
                })?),
                "in" => CompiledOp::In,
                "nin" => CompiledOp::Nin,
                "contains" => CompiledOp::Contains,
                "match" => CompiledOp::Match(glob::Pattern::new(value.as_str()?).map_err(
                    |e| RpcError::invalid_arguments(format!("invalid glob predicate: {}", e)),
                )?),
                other => {
                    return Err(RpcError::invalid_arguments(format!(
                        "unknown predicate operator {:?}",
                        other
                    )));
                }
            };

            clauses.push(Clause { path, op, value });
        }

        Ok(Predicate { clauses })
    }

    fn matches(&self, item: &Object) -> bool {
        self.clauses.iter().all(|clause| clause.matches(item))
    }
}

impl Clause {
    fn matches(&self, item: &Object) -> bool {
        let Some(target) = descend(item, &components(&self.path)) else {
            return false;
        };

        match &self.op {
            CompiledOp::Eq => target == self.value,
            CompiledOp::Ne => target != self.value,
            CompiledOp::Gt => compare(&target, &self.value) == Some(Ordering::Greater),
            CompiledOp::Ge => matches!(
                compare(&target, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            CompiledOp::Lt => compare(&target, &self.value) == Some(Ordering::Less),
            CompiledOp::Le => matches!(
                compare(&target, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            CompiledOp::Regex(re) => target.as_str().map(|s| re.is_match(s)).unwrap_or(false),
            CompiledOp::In => contains_element(&self.value, &target),
            CompiledOp::Nin => !contains_element(&self.value, &target),
            CompiledOp::Contains => contains_element(&target, &self.value),
            CompiledOp::Match(pattern) => target
                .as_str()
                .map(|s| pattern.matches(s))
                .unwrap_or(false),
        }
    }
}

fn contains_element(array: &Object, needle: &Object) -> bool {
    match array.array_iter() {
        Ok(iter) => iter.filter_map(|e| e.ok()).any(|e| e == *needle),
        Err(_) => false,
    }
}

/// Ordering between two values for predicate and sort evaluation.
///
/// Integers, doubles and dates form one numeric family; strings and bools
/// compare within their own tag. Any other pairing is unordered, which makes
/// cross-type relational predicates evaluate to false.
fn compare(a: &Object, b: &Object) -> Option<Ordering> {
    fn numeric(obj: &Object) -> Option<f64> {
        match obj.tag() {
            Tag::Int64 => obj.as_i64().ok().map(|v| v as f64),
            Tag::Uint64 => obj.as_u64().ok().map(|v| v as f64),
            Tag::Double => obj.as_f64().ok(),
            _ => None,
        }
    }

    if let (Some(x), Some(y)) = (numeric(a), numeric(b)) {
        return x.partial_cmp(&y);
    }

    match (a.tag(), b.tag()) {
        (Tag::String, Tag::String) => Some(a.as_str().ok()?.cmp(b.as_str().ok()?)),
        (Tag::Bool, Tag::Bool) => Some(a.as_bool().ok()?.cmp(&b.as_bool().ok()?)),
        (Tag::Date, Tag::Date) => Some(a.as_date().ok()?.cmp(&b.as_date().ok()?)),
        _ => None,
    }
}

/// Lazy sequence of array entries matching a predicate template.
pub struct QueryIter {
    items: std::vec::IntoIter<Object>,
    predicate: Option<Predicate>,
    skip: usize,
    remaining: Option<usize>,
    single: bool,
    done: bool,
}

impl Iterator for QueryIter {
    type Item = Object;

    fn next(&mut self) -> Option<Object> {
        if self.done {
            return None;
        }
        if let Some(0) = self.remaining {
            self.done = true;
            return None;
        }

        loop {
            let item = self.items.next()?;
            let matched = match &self.predicate {
                Some(predicate) => predicate.matches(&item),
                None => true,
            };
            if !matched {
                continue;
            }
            if self.skip > 0 {
                self.skip -= 1;
                continue;
            }
            if let Some(remaining) = &mut self.remaining {
                *remaining -= 1;
            }
            if self.single {
                self.done = true;
            }
            return Some(item);
        }
    }
}

/// Evaluate `predicate_template` against the elements of `root` (an array).
///
/// The template is an array of `[key, operator, value]` triples that must all
/// hold for an element to match; a null template matches everything.
pub fn fmt_iter(root: &Object, params: QueryParams, predicate_template: &Object) -> Result<QueryIter> {
    let predicate = Predicate::compile(predicate_template)?;

    let mut items = Vec::with_capacity(root.len()?);
    for item in root.array_iter()? {
        items.push(item?);
    }
    if params.reverse {
        items.reverse();
    }

    // Sorting and counting need the full match set up front; the plain path
    // stays lazy.
    if params.sort.is_some() || params.count {
        let mut matches: Vec<Object> =
            items.into_iter().filter(|i| predicate.matches(i)).collect();

        if let Some(sort_key) = &params.sort {
            let comps = components(sort_key);
            matches.sort_by(|a, b| {
                let ka = descend(a, &comps);
                let kb = descend(b, &comps);
                match (ka, kb) {
                    (Some(ka), Some(kb)) => compare(&ka, &kb).unwrap_or(Ordering::Equal),
                    _ => Ordering::Equal,
                }
            });
        }

        let mut selected: Vec<Object> = matches.into_iter().skip(params.offset).collect();
        if let Some(limit) = params.limit {
            selected.truncate(limit);
        }
        if params.single {
            selected.truncate(1);
        }
        if params.count {
            selected = vec![Object::uint64(selected.len() as u64)];
        }

        return Ok(QueryIter {
            items: selected.into_iter(),
            predicate: None,
            skip: 0,
            remaining: None,
            single: false,
            done: false,
        });
    }

    Ok(QueryIter {
        items: items.into_iter(),
        predicate: Some(predicate),
        skip: params.offset,
        remaining: params.limit,
        single: params.single,
        done: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::pack::pack;
    use crate::pack_args;

    fn start_object() -> Object {
        Object::dict_from([(
            "array",
            Object::array(vec![
                Object::int64(1),
                Object::int64(2),
                Object::int64(3),
                Object::string("!"),
                Object::string("?"),
            ]),
        )])
    }

    #[test]
    fn get_set_delete_walk() {
        let root = start_object();

        assert_eq!(get(&root, "array.0", None).unwrap().as_i64().unwrap(), 1);

        set(&root, "array.0", Object::boolean(true), false).unwrap();
        assert!(get(&root, "array.0", None).unwrap().as_bool().unwrap());

        delete(&root, "array.0").unwrap();
        assert_eq!(get(&root, "array.0", None).unwrap().as_i64().unwrap(), 2);

        assert!(!contains(&root, "array.10"));
        assert!(contains(&root, "array.0"));
    }

    #[test]
    fn get_returns_default_for_missing_path() {
        let root = start_object();
        let fallback = Object::int64(19);
        let got = get(&root, "array.10", Some(fallback.clone())).unwrap();
        assert_eq!(got, fallback);
    }

    #[test]
    fn set_materialises_missing_levels() {
        let root = start_object();
        set(
            &root,
            "a.0.bunch.1.of.2.nonexistent.3.values",
            Object::boolean(true),
            true,
        )
        .unwrap();

        // Integer-looking components created arrays, the rest dictionaries.
        assert_eq!(get(&root, "a", None).unwrap().tag(), Tag::Array);
        assert_eq!(get(&root, "a.0", None).unwrap().tag(), Tag::Dictionary);
        assert_eq!(get(&root, "a.0.bunch", None).unwrap().tag(), Tag::Array);
        assert!(get(&root, "a.0.bunch.1.of.2.nonexistent.3.values", None)
            .unwrap()
            .as_bool()
            .unwrap());

        delete(&root, "a").unwrap();
        assert!(!contains(&root, "a"));
    }

    #[test]
    fn set_without_create_missing_fails() {
        let root = start_object();
        let err = set(&root, "missing.child", Object::null(), false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn set_is_idempotent() {
        let a = start_object();
        let b = start_object();

        set(&a, "deep.child", Object::int64(7), true).unwrap();
        set(&b, "deep.child", Object::int64(7), true).unwrap();
        set(&b, "deep.child", Object::int64(7), true).unwrap();

        assert_eq!(a, b);
    }

    #[test]
    fn delete_shifts_array_left() {
        let root = start_object();
        let before = get(&root, "array.2", None).unwrap();
        delete(&root, "array.1").unwrap();
        assert_eq!(get(&root, "array.1", None).unwrap(), before);
        assert_eq!(root.get_key("array").unwrap().len().unwrap(), 4);
    }

    #[test]
    fn delete_missing_path_fails() {
        let root = start_object();
        assert_eq!(
            delete(&root, "array.10").unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            delete(&root, "nope").unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    fn values_array() -> Object {
        pack(
            "[{u},{u},{u},{u},{u}]",
            pack_args![
                "value", 1u64, "value", 2u64, "value", 3u64, "value", 4u64, "value", 5u64
            ],
        )
        .unwrap()
    }

    #[test]
    fn fmt_iter_reverse_offset_predicate() {
        let root = values_array();
        let predicate = pack("[[s,s,u]]", pack_args!["value", ">", 2u64]).unwrap();

        let params = QueryParams {
            offset: 1,
            reverse: true,
            ..Default::default()
        };
        let got: Vec<u64> = fmt_iter(&root, params, &predicate)
            .unwrap()
            .map(|o| o.get_key("value").unwrap().as_u64().unwrap())
            .collect();

        // Reversed matches are 5, 4, 3; offset skips the first.
        assert_eq!(got, vec![4, 3]);
    }

    #[test]
    fn fmt_iter_operators() {
        let root = values_array();

        let eq = pack("[[s,s,u]]", pack_args!["value", "=", 3u64]).unwrap();
        assert_eq!(
            fmt_iter(&root, QueryParams::default(), &eq).unwrap().count(),
            1
        );

        let ne = pack("[[s,s,u]]", pack_args!["value", "!=", 3u64]).unwrap();
        assert_eq!(
            fmt_iter(&root, QueryParams::default(), &ne).unwrap().count(),
            4
        );

        let le = pack("[[s,s,u]]", pack_args!["value", "<=", 2u64]).unwrap();
        assert_eq!(
            fmt_iter(&root, QueryParams::default(), &le).unwrap().count(),
            2
        );

        let in_set = pack("[[s,s,[u,u]]]", pack_args!["value", "in", 1u64, 5u64]).unwrap();
        assert_eq!(
            fmt_iter(&root, QueryParams::default(), &in_set)
                .unwrap()
                .count(),
            2
        );

        let nin_set = pack("[[s,s,[u,u]]]", pack_args!["value", "nin", 1u64, 5u64]).unwrap();
        assert_eq!(
            fmt_iter(&root, QueryParams::default(), &nin_set)
                .unwrap()
                .count(),
            3
        );
    }

    #[test]
    fn fmt_iter_string_operators() {
        let root = Object::array(vec![
            Object::dict_from([("name", Object::string("alpha"))]),
            Object::dict_from([("name", Object::string("beta"))]),
            Object::dict_from([("name", Object::string("alpine"))]),
        ]);

        let re = pack("[[s,s,s]]", pack_args!["name", "~", "^al"]).unwrap();
        assert_eq!(
            fmt_iter(&root, QueryParams::default(), &re).unwrap().count(),
            2
        );

        let matched = pack("[[s,s,s]]", pack_args!["name", "match", "*eta"]).unwrap();
        assert_eq!(
            fmt_iter(&root, QueryParams::default(), &matched)
                .unwrap()
                .count(),
            1
        );
    }

    #[test]
    fn fmt_iter_cross_type_comparison_is_false() {
        let root = Object::array(vec![Object::dict_from([(
            "value",
            Object::string("not a number"),
        )])]);
        let predicate = pack("[[s,s,u]]", pack_args!["value", ">", 2u64]).unwrap();
        assert_eq!(
            fmt_iter(&root, QueryParams::default(), &predicate)
                .unwrap()
                .count(),
            0
        );
    }

    #[test]
    fn fmt_iter_sort_single_count() {
        let root = Object::array(vec![
            Object::dict_from([("value", Object::int64(3))]),
            Object::dict_from([("value", Object::int64(1))]),
            Object::dict_from([("value", Object::int64(2))]),
        ]);

        let sorted: Vec<i64> = fmt_iter(
            &root,
            QueryParams {
                sort: Some("value".to_owned()),
                ..Default::default()
            },
            &Object::null(),
        )
        .unwrap()
        .map(|o| o.get_key("value").unwrap().as_i64().unwrap())
        .collect();
        assert_eq!(sorted, vec![1, 2, 3]);

        let single: Vec<Object> = fmt_iter(
            &root,
            QueryParams {
                single: true,
                ..Default::default()
            },
            &Object::null(),
        )
        .unwrap()
        .collect();
        assert_eq!(single.len(), 1);

        let count: Vec<Object> = fmt_iter(
            &root,
            QueryParams {
                count: true,
                ..Default::default()
            },
            &Object::null(),
        )
        .unwrap()
        .collect();
        assert_eq!(count.len(), 1);
        assert_eq!(count[0].as_u64().unwrap(), 3);
    }
}
