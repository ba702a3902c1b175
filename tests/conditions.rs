use quarry::core::{Condition, ConditionBuilder, Filters, Value};
use quarry::error::QuarryError;
use quarry::filters;

fn build(filters: Filters) -> Condition {
    ConditionBuilder::base().build(&filters).unwrap().unwrap()
}

#[test]
fn every_lookup_renders() {
    let cases: &[(&str, Value, &str)] = &[
        ("age", 3.into(), "t.age = :t_age_0"),
        ("age__gt", 3.into(), "t.age > :t_age_0"),
        ("age__lt", 3.into(), "t.age < :t_age_0"),
        ("age__gte", 3.into(), "t.age >= :t_age_0"),
        ("age__lte", 3.into(), "t.age <= :t_age_0"),
        ("age__ne", 3.into(), "t.age != :t_age_0"),
        ("name__contains", "an".into(), "t.name LIKE :t_name_0"),
        ("name__icontains", "an".into(), "t.name ILIKE :t_name_0"),
        ("name__startswith", "an".into(), "t.name LIKE :t_name_0"),
        ("name__istartswith", "an".into(), "t.name ILIKE :t_name_0"),
        ("name__endswith", "an".into(), "t.name LIKE :t_name_0"),
        ("name__iendswith", "an".into(), "t.name ILIKE :t_name_0"),
    ];
    for (key, value, expected) in cases {
        let cond = build(Filters::new().with(*key, value.clone()));
        assert_eq!(cond.to_named().sql, *expected, "{key}");
    }
}

#[test]
fn pattern_lookups_wrap_wildcards() {
    let patterns = [
        ("name__contains", "%an%"),
        ("name__istartswith", "an%"),
        ("name__endswith", "%an"),
    ];
    for (key, pattern) in patterns {
        let named = build(filters! { key => "an" }).to_named();
        assert_eq!(named.param("t_name_0"), Some(&Value::from(pattern)), "{key}");
    }
}

#[test]
fn isnull_follows_the_flag() {
    assert_eq!(
        build(filters! { "deleted_at__isnull" => true }).to_named().sql,
        "t.deleted_at IS NULL"
    );
    assert_eq!(
        build(filters! { "deleted_at__isnull" => false }).to_named().sql,
        "t.deleted_at IS NOT NULL"
    );
}

#[test]
fn in_requires_a_non_empty_list() {
    let empty = ConditionBuilder::base().build(&filters! { "id__in" => Vec::<i64>::new() });
    assert!(matches!(empty, Err(QuarryError::InvalidFilterValue(_))));

    let scalar = ConditionBuilder::base().build(&filters! { "id__in" => 4 });
    assert!(matches!(scalar, Err(QuarryError::InvalidFilterValue(_))));

    let named = build(filters! { "id__in" => vec![1, 2] }).to_named();
    assert_eq!(named.sql, "t.id IN (:t_id_0, :t_id_1)");
}

#[test]
fn unknown_lookup_names_the_suffix() {
    let err = ConditionBuilder::base()
        .build(&filters! { "age__between" => 3 })
        .unwrap_err();
    assert!(matches!(&err, QuarryError::UnsupportedOperator(msg) if msg.contains("between")));
}

#[test]
fn rendering_is_deterministic() {
    let first = build(filters! { "age__gte" => 18, "name__icontains" => "ann" }).to_named();
    let second = build(filters! { "age__gte" => 18, "name__icontains" => "ann" }).to_named();
    assert_eq!(first, second);
}

#[test]
fn or_groups_parenthesize_and_union_params() {
    let young = build(filters! { "age__lt" => 18 });
    let old = build(filters! { "age__gt" => 65 });
    let named = (young | old).to_named();
    assert_eq!(named.sql, "(t.age < :t_age_0) OR (t.age > :t_age_1)");
    assert_eq!(named.param_names().collect::<Vec<_>>(), ["t_age_0", "t_age_1"]);
}

#[test]
fn related_prefix_routes_to_joined_alias() {
    let cond = ConditionBuilder::related("profile")
        .build(&filters! { "name" => "ann", "profile__bio__icontains" => "rust" })
        .unwrap()
        .unwrap();
    assert_eq!(
        cond.to_named().sql,
        "t.name = :t_name_0 AND r.bio ILIKE :r_bio_1"
    );
}

#[test]
fn raw_bypass_is_combinable() {
    let raw = Condition::raw(
        "t.kind = :kind OR t.kind = :other",
        filters! { "kind" => "a", "other" => "b" },
    )
    .unwrap();
    let named = build(filters! { "age__gte" => 1 }).and(raw).to_named();
    assert_eq!(
        named.sql,
        "(t.age >= :t_age_0) AND (t.kind = :kind OR t.kind = :other)"
    );
    assert_eq!(named.params.len(), 3);
}

#[test]
fn empty_filters_build_nothing() {
    assert!(ConditionBuilder::base().build(&Filters::new()).unwrap().is_none());
}
