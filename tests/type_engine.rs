use ecsearch::types::{arrow, tbool, tint, tlist, tvar, Type, TypeContext, UnificationError};
use proptest::prelude::*;

fn tuple(args: Vec<Type>) -> Type {
    Type::Constructed("tuple".to_string(), args)
}

fn arb_ground() -> impl Strategy<Value = Type> {
    prop_oneof![Just(tint()), Just(tbool())].prop_recursive(3, 16, 3, |inner| {
        prop_oneof![
            inner.clone().prop_map(tlist),
            (inner.clone(), inner.clone()).prop_map(|(a, b)| arrow(a, b)),
            prop::collection::vec(inner, 1..=3).prop_map(tuple),
        ]
    })
}

/// Types over the variables t0, t1 and t2.
fn arb_type() -> impl Strategy<Value = Type> {
    prop_oneof![Just(tint()), Just(tbool()), (0usize..3).prop_map(tvar)].prop_recursive(
        3,
        16,
        3,
        |inner| {
            prop_oneof![
                inner.clone().prop_map(tlist),
                (inner.clone(), inner.clone()).prop_map(|(a, b)| arrow(a, b)),
                prop::collection::vec(inner, 1..=3).prop_map(tuple),
            ]
        },
    )
}

fn context_with_three_variables() -> TypeContext {
    let mut context = TypeContext::new();
    for _ in 0..3 {
        context.fresh();
    }
    context
}

proptest! {
    #[test]
    fn prop_unify_ground_reflexive(t in arb_ground()) {
        let context = TypeContext::new().unify(&t, &t).unwrap();
        prop_assert_eq!(context.apply(&t), t);
    }

    #[test]
    fn prop_unify_any_type_with_itself(t in arb_type()) {
        let context = context_with_three_variables();
        prop_assert!(context.unify(&t, &t).is_ok());
    }

    #[test]
    fn prop_unify_makes_sides_equal(a in arb_type(), b in arb_type()) {
        let context = context_with_three_variables();
        if let Ok(unified) = context.unify(&a, &b) {
            prop_assert_eq!(unified.apply(&a), unified.apply(&b));
        }
    }

    #[test]
    fn prop_unify_symmetric(a in arb_type(), b in arb_type()) {
        let context = context_with_three_variables();
        prop_assert_eq!(context.unify(&a, &b).is_ok(), context.unify(&b, &a).is_ok());
    }

    #[test]
    fn prop_unify_failure_is_occurs_or_mismatch(a in arb_type(), b in arb_type()) {
        let context = context_with_three_variables();
        match context.unify(&a, &b) {
            Ok(_) => {}
            Err(UnificationError::Occurs { variable, ty }) => {
                prop_assert_ne!(&ty, &tvar(variable));
                prop_assert!(ty.occurs(variable));
            }
            Err(UnificationError::Mismatch { left, right }) => match (&left, &right) {
                (Type::Constructed(n1, a1), Type::Constructed(n2, a2)) => {
                    prop_assert!(n1 != n2 || a1.len() != a2.len());
                }
                _ => prop_assert!(false, "mismatch between {} and {}", left, right),
            },
        }
    }

    #[test]
    fn prop_apply_idempotent(a in arb_type(), b in arb_type()) {
        let context = context_with_three_variables();
        if let Ok(unified) = context.unify(&a, &b) {
            let once = unified.apply(&a);
            prop_assert_eq!(unified.apply(&once), once);
        }
    }
}

#[test]
fn test_occurs_check() {
    let context = context_with_three_variables();
    let err = context.unify(&tvar(0), &tlist(tvar(0))).unwrap_err();
    assert_eq!(
        err,
        UnificationError::Occurs {
            variable: 0,
            ty: tlist(tvar(0)),
        }
    );
}

#[test]
fn test_arity_mismatch() {
    let context = TypeContext::new();
    let err = context
        .unify(&tuple(vec![tint()]), &tuple(vec![tint(), tint()]))
        .unwrap_err();
    assert!(matches!(err, UnificationError::Mismatch { .. }));
}

#[test]
fn test_instantiate_renames_apart() {
    let mut context = context_with_three_variables();
    let scheme = arrow(tvar(0), tvar(0));
    let instance = context.instantiate_in_place(&scheme);
    assert_eq!(instance, arrow(tvar(3), tvar(3)));
    assert_eq!(context.next_variable(), 4);
    assert_eq!(instance.canonical(), scheme);
}
