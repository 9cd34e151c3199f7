use ecsearch::library::{lists, SymbolTable};
use ecsearch::parser::Parser;
use ecsearch::program::Term;
use ecsearch::types::{arrow, tint, tlist};
use proptest::prelude::*;
use std::sync::Arc;

fn inventions(symbols: &SymbolTable) -> Vec<Term> {
    let parser = Parser::new(symbols);
    ["#(lambda (+ $0 1))", "#(lambda (lambda (cons $1 $0)))", "#(map (lambda (* $0 $0)))"]
        .iter()
        .map(|text| parser.parse(text).unwrap())
        .collect()
}

fn arb_term(symbols: Arc<SymbolTable>) -> impl Strategy<Value = Term> {
    let primitives: Vec<Term> = symbols.primitives().iter().map(Term::primitive).collect();
    let leaf = prop_oneof![
        4 => (0usize..4).prop_map(Term::Index),
        6 => prop::sample::select(primitives),
        1 => prop::sample::select(inventions(&symbols)),
        1 => Just(Term::FragmentVariable),
    ];
    leaf.prop_recursive(4, 24, 2, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone()).prop_map(|(f, x)| Term::application(f, x)),
            inner.prop_map(Term::abstraction),
        ]
    })
}

proptest! {
    #[test]
    fn prop_print_parse_round_trip(program in arb_term(Arc::new(lists()))) {
        let symbols = lists();
        let parsed = Parser::new(&symbols).parse(&program.to_string()).unwrap();
        prop_assert_eq!(parsed, program);
    }

    #[test]
    fn prop_shift_composes(program in arb_term(Arc::new(lists())), n in -3i64..4, m in -3i64..4) {
        if let Ok(twice) = program.shift(n).and_then(|p| p.shift(m)) {
            prop_assert_eq!(program.shift(n + m).ok(), Some(twice));
        }
    }

    #[test]
    fn prop_raising_never_fails(program in arb_term(Arc::new(lists())), n in 0i64..4, m in 0i64..4) {
        let twice = program.shift(n).and_then(|p| p.shift(m));
        prop_assert!(twice.is_ok());
        prop_assert_eq!(twice.ok(), program.shift(n + m).ok());
    }
}

#[test]
fn test_shift_below_zero_fails() {
    assert!(Term::Index(0).shift(-1).is_err());
    assert_eq!(Term::abstraction(Term::Index(0)).shift(-1).ok(), Some(Term::abstraction(Term::Index(0))));
}

#[test]
fn test_parsed_programs_type_check() {
    let symbols = lists();
    let parser = Parser::new(&symbols);
    let sum = parser.parse("(lambda (fold $0 0 (lambda (lambda (+ $1 $0)))))").unwrap();
    assert!(sum.can_have_type(&arrow(tlist(tint()), tint())));
    assert!(!sum.can_have_type(&arrow(tint(), tint())));
    assert_eq!(sum.to_string(), "(lambda (fold $0 0 (lambda (lambda (+ $1 $0)))))");
}

#[test]
fn test_invented_prints_with_hash() {
    let symbols = lists();
    let inc = &inventions(&symbols)[0];
    let program = Term::application(inc.clone(), Term::Index(0));
    assert_eq!(program.to_string(), "(#(lambda (+ $0 1)) $0)");
    assert_eq!(program.size(), 2);
}
