/// Builds a [`Row`](quarry_core::Row) from `name => value` pairs, in order.
///
/// ```rust
/// use quarry::row;
///
/// let row = row! { "name" => "Alice", "age" => 30 };
/// assert_eq!(row.keys().collect::<Vec<_>>(), ["name", "age"]);
/// ```
#[macro_export]
macro_rules! row {
    () => {
        $crate::core::Row::new()
    };
    ($($name:expr => $value:expr),+ $(,)?) => {{
        let mut row = $crate::core::Row::with_capacity($crate::__count!($($name)+));
        $(row.insert($name, $value);)+
        row
    }};
}

/// Builds [`Filters`](quarry_core::Filters) from `key => value` pairs.
/// Keys follow the lookup grammar, e.g. `"age__gte"` or `"email__icontains"`.
///
/// ```rust
/// use quarry::filters;
///
/// let filters = filters! { "age__gte" => 18, "name__startswith" => "A" };
/// assert_eq!(filters.len(), 2);
/// ```
#[macro_export]
macro_rules! filters {
    ($($tt:tt)*) => {
        $crate::row!($($tt)*)
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __count {
    () => { 0usize };
    ($head:tt $($tail:tt)*) => { 1usize + $crate::__count!($($tail)*) };
}
