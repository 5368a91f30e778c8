use super::parser::{number_value, BinOp, Expr, Segment};
use super::{stringify, Context, EvalError};
use serde_json::{Map, Value};

/// Namespaces holding multi-valued entries where a bare name means index 0.
const INDEXED_NAMESPACES: [&str; 3] = ["header", "query", "post"];

/// Namespaces whose keys are stored lower-cased.
const FOLDED_NAMESPACES: [&str; 4] = ["header", "query", "post", "url"];

pub(super) fn evaluate(expr: &Expr, ctx: &Context) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Variable(name) => ctx
            .vars()
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::UnknownVariable(name.clone())),
        Expr::Traverse { base, segments } => traverse(base, segments, ctx),
        Expr::Call { name, args } => call(name, args, ctx),
        Expr::Neg(inner) => {
            let value = evaluate(inner, ctx)?;
            let n = as_number(&value)?;
            Ok(number_value(-n))
        }
        Expr::Binary { op, lhs, rhs } => {
            let lhs = evaluate(lhs, ctx)?;
            let rhs = evaluate(rhs, ctx)?;
            binary(*op, lhs, rhs)
        }
    }
}

fn traverse(base: &Expr, segments: &[Segment], ctx: &Context) -> Result<Value, EvalError> {
    let root = match base {
        Expr::Variable(name) => Some(name.as_str()),
        _ => None,
    };
    let mut path = root.map(str::to_string).unwrap_or_else(|| "<value>".into());
    let mut current = evaluate(base, ctx)?;

    for (depth, segment) in segments.iter().enumerate() {
        let key = match segment {
            Segment::Name(name) if depth == 0 && root.is_some_and(|r| FOLDED_NAMESPACES.contains(&r)) => {
                Value::String(name.to_ascii_lowercase())
            }
            Segment::Name(name) => Value::String(name.clone()),
            Segment::Index(expr) => evaluate(expr, ctx)?,
        };
        path.push('.');
        path.push_str(&stringify(&key));
        current = step(current, &key).ok_or_else(|| EvalError::UnknownVariable(path.clone()))?;
    }

    if segments.len() == 1 && root.is_some_and(|r| INDEXED_NAMESPACES.contains(&r)) {
        if let Value::Array(items) = current {
            return items
                .into_iter()
                .next()
                .ok_or(EvalError::UnknownVariable(format!("{path}.0")));
        }
    }
    Ok(current)
}

fn step(value: Value, key: &Value) -> Option<Value> {
    match (value, key) {
        (Value::Object(mut map), Value::String(k)) => map.remove(k),
        (Value::Object(mut map), Value::Number(n)) => map.remove(&n.to_string()),
        (Value::Array(items), Value::String(k)) => {
            let idx: usize = k.parse().ok()?;
            items.into_iter().nth(idx)
        }
        (Value::Array(items), Value::Number(n)) => {
            let idx = n.as_u64()? as usize;
            items.into_iter().nth(idx)
        }
        _ => None,
    }
}

fn call(name: &str, args: &[Expr], ctx: &Context) -> Result<Value, EvalError> {
    let values: Vec<Value> = args
        .iter()
        .map(|a| evaluate(a, ctx))
        .collect::<Result<_, _>>()?;

    if name == "text" {
        return render_text(&values, ctx);
    }
    let function = ctx
        .functions()
        .get(name)
        .ok_or_else(|| EvalError::UnknownFunction(name.to_string()))?;
    function(&values)
}

/// `text(name, args...)` renders a configured text block with `arg.<i>`.
fn render_text(values: &[Value], ctx: &Context) -> Result<Value, EvalError> {
    let Some(Value::String(name)) = values.first() else {
        return Err(EvalError::function("text", "first argument must be a text name"));
    };
    let template = ctx
        .functions()
        .text(name)
        .ok_or_else(|| EvalError::function("text", format!("no text block named {name:?}")))?;

    let mut args = Map::new();
    for (i, value) in values[1..].iter().enumerate() {
        args.insert(i.to_string(), value.clone());
    }
    let scoped = ctx.enter_text(name)?.with_var("arg", Value::Object(args));
    template.render_string(&scoped).map(Value::String)
}

fn as_number(value: &Value) -> Result<f64, EvalError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| EvalError::Type(format!("{n} is not representable"))),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| EvalError::Type(format!("{s:?} is not a number"))),
        other => Err(EvalError::Type(format!("{other} is not a number"))),
    }
}

fn binary(op: BinOp, lhs: Value, rhs: Value) -> Result<Value, EvalError> {
    if op == BinOp::Add && (lhs.is_string() || rhs.is_string()) {
        // numeric strings still add numerically
        if let (Ok(a), Ok(b)) = (as_number(&lhs), as_number(&rhs)) {
            if !(lhs.is_string() && rhs.is_string()) {
                return Ok(number_value(a + b));
            }
        }
        return Ok(Value::String(format!(
            "{}{}",
            stringify(&lhs),
            stringify(&rhs)
        )));
    }

    let a = as_number(&lhs)?;
    let b = as_number(&rhs)?;
    let result = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Err(EvalError::Type("division by zero".into()));
            }
            a / b
        }
    };
    Ok(number_value(result))
}

#[cfg(test)]
mod tests {
    use super::super::{FunctionTable, Template};
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn ctx(vars: Value) -> Context {
        let map = match vars {
            Value::Object(m) => m,
            _ => Map::new(),
        };
        let mut table = FunctionTable::default();
        table.register(
            "upper",
            Arc::new(|args: &[Value]| {
                Ok(Value::String(
                    args.first().map(stringify).unwrap_or_default().to_uppercase(),
                ))
            }),
        );
        table.add_text("greet", Template::parse("Hello, ${arg.0} x${arg.1}").unwrap());
        Context::new(map, Arc::new(table))
    }

    fn eval(src: &str, c: &Context) -> Result<Value, EvalError> {
        Template::parse(src).unwrap().render(c)
    }

    #[test]
    fn test_implicit_index_zero() {
        let c = ctx(json!({"header": {"a": ["b", "c"]}, "query": {"q": ["1"]}}));
        assert_eq!(eval("${header.a}", &c).unwrap(), json!("b"));
        assert_eq!(eval("${header.a.1}", &c).unwrap(), json!("c"));
        assert_eq!(eval("${query.q}", &c).unwrap(), json!("1"));
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let c = ctx(json!({"header": {"x-token": ["t"]}}));
        assert_eq!(eval("${header.X-Token}", &c).unwrap(), json!("t"));
    }

    #[test]
    fn test_missing_variable_is_error() {
        let c = ctx(json!({"query": {}}));
        assert_eq!(
            eval("${query.hello}", &c),
            Err(EvalError::UnknownVariable("query.hello".into()))
        );
        assert!(eval("${nope}", &c).is_err());
    }

    #[test]
    fn test_arithmetic_and_concat() {
        let c = ctx(json!({"n": 4}));
        assert_eq!(eval("${n * 2 - 1}", &c).unwrap(), json!(7));
        assert_eq!(eval("${n / 8}", &c).unwrap(), json!(0.5));
        assert_eq!(eval(r#"${"a" + "b"}"#, &c).unwrap(), json!("ab"));
        assert_eq!(eval(r#"${"2" + 3}"#, &c).unwrap(), json!(5));
        assert_eq!(eval("${-n}", &c).unwrap(), json!(-4));
        assert!(eval("${n / 0}", &c).is_err());
    }

    #[test]
    fn test_function_calls() {
        let c = ctx(json!({"url": {"id": "abc"}}));
        assert_eq!(eval("${upper(url.id)}", &c).unwrap(), json!("ABC"));
        assert_eq!(
            eval("${missing()}", &c),
            Err(EvalError::UnknownFunction("missing".into()))
        );
    }

    #[test]
    fn test_text_blocks() {
        let c = ctx(json!({}));
        assert_eq!(
            eval(r#"${text("greet", "World", 2)}"#, &c).unwrap(),
            json!("Hello, World x2")
        );
        assert!(eval(r#"${text("nope")}"#, &c).is_err());
    }

    #[test]
    fn test_recursive_text_block_is_bounded() {
        let mut table = FunctionTable::default();
        table.add_text("loop", Template::parse(r#"x${text("loop")}"#).unwrap());
        let c = Context::new(Map::new(), Arc::new(table));

        let err = eval(r#"${text("loop")}"#, &c).unwrap_err();
        assert!(matches!(err, EvalError::Function { ref function, .. } if function == "text"));
        assert!(err.to_string().contains("nests deeper than 32"));

        // legitimate nesting below the limit still renders
        let mut table = FunctionTable::default();
        table.add_text("outer", Template::parse(r#"[${text("inner")}]"#).unwrap());
        table.add_text("inner", Template::parse("in").unwrap());
        let c = Context::new(Map::new(), Arc::new(table));
        assert_eq!(eval(r#"${text("outer")}"#, &c).unwrap(), json!("[in]"));
    }

    #[test]
    fn test_traverse_call_result() {
        let mut table = FunctionTable::default();
        table.register(
            "obj",
            Arc::new(|_: &[Value]| Ok(json!({"nested": {"value": "World"}}))),
        );
        let c = Context::new(Map::new(), Arc::new(table));
        assert_eq!(eval("${obj().nested.value}", &c).unwrap(), json!("World"));
    }
}
