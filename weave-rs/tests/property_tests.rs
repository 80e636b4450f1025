use std::sync::Arc;

use proptest::prelude::*;
use weave::template::lexer::tokenize;
use weave::template::{compile, Delimiters, Registry};
use weave::{Config, Engine, MemoryCache, MemoryStorage, Scope};

const OPS: [&str; 9] = ["+", "-", "*", "/", "%", "..", "<", "==", "&&"];

fn unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#039;", "'")
        .replace("&amp;", "&")
}

/// Markup without delimiters, or a constant expression tag.
fn chunk() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-zA-Z <>&.\n]{0,12}",
        (-50i64..50, 0usize..OPS.len(), -50i64..50).prop_map(|(a, op, b)| format!("{{{a} {} {b}}}", OPS[op])),
        (1i64..4, 1i64..6).prop_map(|(a, b)| format!("{{loop $i in {a},{b}}}<{{$i}}>{{end}}")),
        "[a-z<>&]{0,6}".prop_map(|s| format!("{{\"{s}\"|escape}}")),
    ]
}

proptest! {
    /// The lexer returns Ok or Err on any input; it never panics.
    #[test]
    fn lexer_does_not_panic(s in "\\PC*") {
        let _ = tokenize("p", &s, &Delimiters::default());
    }

    #[test]
    fn compiler_does_not_panic(s in "\\PC*") {
        let _ = compile("p", &s, &Delimiters::default(), &Registry::with_builtins());
    }

    /// Tag-heavy input reaches deeper into the parser than arbitrary text.
    #[test]
    fn compiler_survives_tag_soup(parts in prop::collection::vec(
        prop_oneof![
            Just("{"), Just("}"), Just("if "), Just("end"), Just("else"), Just("$x"),
            Just("("), Just(")"), Just("["), Just("]"), Just("=>"), Just(","), Just("|"),
            Just("1"), Just("+"), Just("section s"), Just("foreach $v in "), Just("\""),
        ],
        0..40,
    )) {
        let src: String = parts.concat();
        let _ = compile("p", &src, &Delimiters::default(), &Registry::with_builtins());
    }
}

proptest! {
    /// Constant folding gives the same result as evaluating at run time.
    #[test]
    fn folding_matches_runtime(
        a in -20i64..20, b in -20i64..20, c in -20i64..20,
        op1 in 0usize..OPS.len(), op2 in 0usize..OPS.len(),
    ) {
        let e = Engine::new(Config::default());
        let (o1, o2) = (OPS[op1], OPS[op2]);
        let folded = e
            .render_str("f", &format!("{{{a} {o1} {b} {o2} {c}}}"), &mut Scope::new())
            .unwrap();
        let mut scope = Scope::new();
        scope.set("a", a);
        scope.set("b", b);
        scope.set("c", c);
        let live = e
            .render_str("l", &format!("{{$a {o1} $b {o2} $c}}"), &mut scope)
            .unwrap();
        prop_assert_eq!(folded, live);
    }

    /// Escaped output has no raw special characters and decodes back.
    #[test]
    fn escaped_output_is_safe(s in "\\PC*") {
        let e = Engine::new(Config::default());
        let mut scope = Scope::new();
        scope.set("s", s.as_str());
        let out = e.render_str("e", "{$s|escape}", &mut scope).unwrap();
        prop_assert!(!out.contains(&['<', '>', '"', '\''][..]));
        prop_assert_eq!(unescape(&out), s);
    }

    /// Replaying an HTML-cache artifact reproduces the direct render.
    #[test]
    fn replay_matches_direct_render(chunks in prop::collection::vec(chunk(), 0..8)) {
        let src: String = chunks.concat();
        let mem = Arc::new(MemoryStorage::new());
        mem.insert("page", &src);
        let mut config = Config::default();
        config.default_storage = "mem".into();
        let mut e = Engine::new(config);
        e.add_storage("mem", mem);
        e.set_cache(Arc::new(MemoryCache::new()));

        let direct = e.render_str("page", &src, &mut Scope::new()).unwrap();
        let recorded = e.render("page", &mut Scope::new()).unwrap();
        let replayed = e.render("page", &mut Scope::new()).unwrap();
        prop_assert_eq!(&direct, &recorded);
        prop_assert_eq!(&direct, &replayed);
    }
}
