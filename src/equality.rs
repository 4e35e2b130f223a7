//! Structural equality with a recursion budget.
//!
//! `eq_depth(a, b, 0)` is identity: primitives compare by value, composites
//! only match when both sides are the same value in memory (or the same `Arc`).
//! Each composite layer (struct, sequence, map) spends one unit of depth
//! before comparing its children. `deep_eq` never runs out of budget.
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

pub trait Structural {
    fn eq_depth(&self, other: &Self, depth: usize) -> bool;

    fn deep_eq(&self, other: &Self) -> bool {
        self.eq_depth(other, usize::MAX)
    }
}

/// Compare two values, descending at most `depth` composite layers
pub fn shallow_equal_depth<T: Structural + ?Sized>(a: &T, b: &T, depth: usize) -> bool {
    a.eq_depth(b, depth)
}

/// Compare two values all the way down
pub fn deep_equal<T: Structural + ?Sized>(a: &T, b: &T) -> bool {
    a.deep_eq(b)
}

/// Implements [`Structural`] for a struct by comparing the listed fields one
/// level below the struct itself.
///
/// ```
/// use querycache::impl_structural;
///
/// struct Todo {
///     id: u32,
///     title: String,
/// }
///
/// impl_structural!(Todo { id, title });
/// ```
#[macro_export]
macro_rules! impl_structural {
    ($ty:ty { $($field:ident),* $(,)? }) => {
        impl $crate::equality::Structural for $ty {
            fn eq_depth(&self, other: &Self, depth: usize) -> bool {
                if ::std::ptr::eq(self, other) {
                    return true;
                }
                if depth == 0 {
                    return false;
                }
                true $(&& $crate::equality::Structural::eq_depth(&self.$field, &other.$field, depth - 1))*
            }
        }
    };
}

macro_rules! impl_value_eq {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Structural for $ty {
                fn eq_depth(&self, other: &Self, _depth: usize) -> bool {
                    self == other
                }
            }
        )*
    };
}

impl_value_eq!(
    (),
    bool,
    char,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    String,
    str,
    NaiveDate,
    NaiveDateTime,
);

impl Structural for f64 {
    fn eq_depth(&self, other: &Self, _depth: usize) -> bool {
        self == other || (self.is_nan() && other.is_nan())
    }
}

impl Structural for f32 {
    fn eq_depth(&self, other: &Self, _depth: usize) -> bool {
        self == other || (self.is_nan() && other.is_nan())
    }
}

impl<Tz: TimeZone> Structural for DateTime<Tz> {
    fn eq_depth(&self, other: &Self, _depth: usize) -> bool {
        self == other
    }
}

impl<T: Structural + ?Sized> Structural for Arc<T> {
    fn eq_depth(&self, other: &Self, depth: usize) -> bool {
        Arc::ptr_eq(self, other) || (**self).eq_depth(&**other, depth)
    }
}

impl<T: Structural + ?Sized> Structural for Box<T> {
    fn eq_depth(&self, other: &Self, depth: usize) -> bool {
        (**self).eq_depth(&**other, depth)
    }
}

impl<T: Structural> Structural for Option<T> {
    fn eq_depth(&self, other: &Self, depth: usize) -> bool {
        match (self, other) {
            (None, None) => true,
            (Some(a), Some(b)) => a.eq_depth(b, depth),
            _ => false,
        }
    }
}

fn seq_eq_depth<'a, T: Structural + 'a>(
    a: impl ExactSizeIterator<Item = &'a T>,
    b: impl ExactSizeIterator<Item = &'a T>,
    depth: usize,
) -> bool {
    if depth == 0 || a.len() != b.len() {
        return false;
    }
    a.zip(b).all(|(x, y)| x.eq_depth(y, depth - 1))
}

impl<T: Structural> Structural for [T] {
    fn eq_depth(&self, other: &Self, depth: usize) -> bool {
        std::ptr::eq(self, other) || seq_eq_depth(self.iter(), other.iter(), depth)
    }
}

impl<T: Structural> Structural for Vec<T> {
    fn eq_depth(&self, other: &Self, depth: usize) -> bool {
        self.as_slice().eq_depth(other.as_slice(), depth)
    }
}

impl<T: Structural> Structural for VecDeque<T> {
    fn eq_depth(&self, other: &Self, depth: usize) -> bool {
        std::ptr::eq(self, other) || seq_eq_depth(self.iter(), other.iter(), depth)
    }
}

impl<K: Ord, V: Structural> Structural for BTreeMap<K, V> {
    fn eq_depth(&self, other: &Self, depth: usize) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        if depth == 0 || self.len() != other.len() {
            return false;
        }
        self.iter().all(|(k, v)| {
            other
                .get(k)
                .is_some_and(|theirs| v.eq_depth(theirs, depth - 1))
        })
    }
}

impl<K: Eq + Hash, V: Structural, S: BuildHasher> Structural for HashMap<K, V, S> {
    fn eq_depth(&self, other: &Self, depth: usize) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        if depth == 0 || self.len() != other.len() {
            return false;
        }
        self.iter().all(|(k, v)| {
            other
                .get(k)
                .is_some_and(|theirs| v.eq_depth(theirs, depth - 1))
        })
    }
}

impl Structural for serde_json::Value {
    fn eq_depth(&self, other: &Self, depth: usize) -> bool {
        use serde_json::Value;

        if std::ptr::eq(self, other) {
            return true;
        }
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => {
                a == b || matches!((a.as_f64(), b.as_f64()), (Some(x), Some(y)) if x == y)
            }
            (Value::Array(a), Value::Array(b)) => a.eq_depth(b, depth),
            (Value::Object(a), Value::Object(b)) => {
                if depth == 0 || a.len() != b.len() {
                    return false;
                }
                a.iter().all(|(k, v)| {
                    b.get(k)
                        .is_some_and(|theirs| v.eq_depth(theirs, depth - 1))
                })
            }
            _ => false,
        }
    }
}
