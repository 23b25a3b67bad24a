/// Value tag for a JDWP type signature (`I`, `Ljava/lang/String;` → `L`, ...).
pub fn signature_to_tag(signature: &str) -> u8 {
    signature.as_bytes().first().copied().unwrap_or(b'V')
}

/// `com.example.Foo` → `Lcom/example/Foo;`. Signatures pass through unchanged.
pub fn class_name_to_signature(class: &str) -> String {
    if class.starts_with('L') && class.ends_with(';') {
        return class.to_string();
    }
    let internal = class.replace('.', "/");
    format!("L{internal};")
}

/// `Lcom/example/Foo;` → `com.example.Foo`, `[I` → `int[]`.
pub fn signature_to_class_name(signature: &str) -> String {
    if let Some(element) = signature.strip_prefix('[') {
        return format!("{}[]", signature_to_class_name(element));
    }
    match signature {
        "Z" => "boolean".to_string(),
        "B" => "byte".to_string(),
        "C" => "char".to_string(),
        "S" => "short".to_string(),
        "I" => "int".to_string(),
        "J" => "long".to_string(),
        "F" => "float".to_string(),
        "D" => "double".to_string(),
        "V" => "void".to_string(),
        _ => signature
            .strip_prefix('L')
            .and_then(|s| s.strip_suffix(';'))
            .unwrap_or(signature)
            .replace('/', "."),
    }
}

/// JDWP class patterns: exact names, or a single leading/trailing `*`.
pub fn class_pattern_matches(pattern: &str, class_name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return class_name.starts_with(prefix);
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        return class_name.ends_with(suffix);
    }
    pattern == class_name
}
