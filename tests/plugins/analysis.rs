use custodes::plugins::analysis::{self, FindingKind};
use custodes::plugins::persona::Persona;

#[test]
fn imperium_rewrites_print_calls() {
    let content = "void main() {\n  print('hello');\n  print('world');\n}\n";
    let a = analysis::analyze_file(Persona::Imperium, "lib/main.dart", content);
    let finding = a
        .findings
        .iter()
        .find(|f| f.rule_id == "imperium.debug_print")
        .unwrap();
    assert_eq!(finding.matches, 2);
    assert_eq!(finding.line, 2);

    let rewrite = a.rewrite.unwrap();
    assert!(rewrite.code_after.contains("debugPrint('hello');"));
    assert!(!rewrite.code_after.contains(" print("));
    assert_eq!(rewrite.improvement_type, "performance");
}

#[test]
fn rules_only_fire_for_their_persona_and_extension() {
    let content = "print('x');\n";
    assert!(analysis::analyze_file(Persona::Guardian, "lib/a.dart", content)
        .findings
        .is_empty());
    assert!(analysis::analyze_file(Persona::Imperium, "src/a.py", content)
        .findings
        .is_empty());
}

#[test]
fn set_state_needs_more_than_three_calls() {
    let three = "setState(() {});\n".repeat(3);
    let four = "setState(() {});\n".repeat(4);
    let ids = |c: &str| {
        analysis::analyze_file(Persona::Imperium, "a.dart", c)
            .findings
            .into_iter()
            .map(|f| f.rule_id)
            .collect::<Vec<_>>()
    };
    assert!(!ids(&three).contains(&"imperium.set_state_churn".to_string()));
    assert!(ids(&four).contains(&"imperium.set_state_churn".to_string()));
}

#[test]
fn guardian_replaces_hardcoded_password_and_trailing_whitespace() {
    let content = "final password = \"hunter2\";   \nfinal ok = 1;\n";
    let a = analysis::analyze_file(Persona::Guardian, "lib/auth.dart", content);
    let kinds: Vec<FindingKind> = a.findings.iter().map(|f| f.kind).collect();
    assert!(kinds.contains(&FindingKind::Security));
    assert!(kinds.contains(&FindingKind::Quality));

    let rewrite = a.rewrite.unwrap();
    assert!(rewrite
        .code_after
        .contains("password = Platform.environment['APP_PASSWORD'] ?? ''"));
    assert!(!rewrite.code_after.contains("hunter2"));
    assert!(!rewrite.code_after.contains("   \n"));
    // Confidence is the weakest applied rule's.
    assert_eq!(rewrite.confidence, 0.9);
    assert!(analysis::security_findings(&rewrite.code_after).is_empty());
}

#[test]
fn findings_without_replacement_produce_no_rewrite() {
    let long = format!("// {}\n", "x".repeat(130));
    let a = analysis::analyze_file(Persona::Guardian, "lib/a.ts", &long);
    assert_eq!(a.findings.len(), 1);
    assert_eq!(a.findings[0].rule_id, "guardian.long_line");
    assert!(a.rewrite.is_none());
}

#[test]
fn sandbox_and_conquest_migrations() {
    let s = analysis::analyze_file(
        Persona::Sandbox,
        "lib/ui.dart",
        "RaisedButton(onPressed: f); FlatButton(onPressed: g);",
    );
    let code = s.rewrite.unwrap().code_after;
    assert_eq!(code, "ElevatedButton(onPressed: f); TextButton(onPressed: g);");

    let c = analysis::analyze_file(
        Persona::Conquest,
        "lib/list.dart",
        "if (items.length == 0 || other.length > 0) {}",
    );
    assert_eq!(
        c.rewrite.unwrap().code_after,
        "if (items.isEmpty || other.isNotEmpty) {}"
    );
}

#[test]
fn analyze_files_keeps_input_order() {
    let files: Vec<(String, String)> = (0..20)
        .map(|i| (format!("lib/f{:02}.dart", i), format!("print({});\n", i)))
        .collect();
    let out = analysis::analyze_files(Persona::Imperium, &files);
    assert_eq!(out.len(), 20);
    for (i, a) in out.iter().enumerate() {
        assert_eq!(a.path, format!("lib/f{:02}.dart", i));
        assert!(a.rewrite.is_some());
    }
}

#[test]
fn rules_for_each_persona_exist() {
    for p in Persona::ALL {
        assert!(analysis::rules_for(p).count() >= 2, "{} has too few rules", p);
    }
}
