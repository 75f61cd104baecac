//! nom grammar for the expression language.
//!
//! Precedence, lowest first: ternary, `||`, `&&`, equality, relational
//! (including `=~`, `!~`, `in`), additive, multiplicative, unary, postfix.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char, digit0, digit1, multispace0, one_of, satisfy},
    combinator::{not, opt, recognize, value},
    multi::separated_list0,
    sequence::{delimited, pair, preceded, terminated},
    IResult, Parser,
};

use super::ExprError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Match,
    NotMatch,
    In,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryOp {
    Not,
    Neg,
}

/// Untyped syntax tree, before function names and literal patterns are
/// resolved.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Ast {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Ast>),
    Ident(String),
    Unary(UnaryOp, Box<Ast>),
    Binary(BinaryOp, Box<Ast>, Box<Ast>),
    Ternary(Box<Ast>, Box<Ast>, Box<Ast>),
    Member(Box<Ast>, String),
    Index(Box<Ast>, Box<Ast>),
    Call(String, Vec<Ast>),
}

pub(crate) fn parse(src: &str) -> Result<Ast, ExprError> {
    match expr(src) {
        Ok((rest, ast)) if rest.trim().is_empty() => Ok(ast),
        Ok((rest, _)) => Err(ExprError::Parse {
            src: src.to_string(),
            reason: format!("unexpected input at offset {}", src.len() - rest.len()),
        }),
        Err(nom::Err::Error(e) | nom::Err::Failure(e)) => Err(ExprError::Parse {
            src: src.to_string(),
            reason: format!("unexpected input at offset {}", src.len() - e.input.len()),
        }),
        Err(nom::Err::Incomplete(_)) => Err(ExprError::Parse {
            src: src.to_string(),
            reason: "incomplete expression".to_string(),
        }),
    }
}

fn ws<'a, O, P>(inner: P) -> impl Parser<&'a str, Output = O, Error = nom::error::Error<&'a str>>
where
    P: Parser<&'a str, Output = O, Error = nom::error::Error<&'a str>>,
{
    delimited(multispace0, inner, multispace0)
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn expr(input: &str) -> IResult<&str, Ast> {
    ternary(input)
}

fn ternary(input: &str) -> IResult<&str, Ast> {
    let (input, cond) = or_expr(input)?;
    let (input, branches) = opt(pair(
        preceded(ws(char('?')), expr),
        preceded(ws(char(':')), expr),
    ))
    .parse(input)?;

    match branches {
        Some((then, otherwise)) => Ok((
            input,
            Ast::Ternary(Box::new(cond), Box::new(then), Box::new(otherwise)),
        )),
        None => Ok((input, cond)),
    }
}

/// Left-associative chain of `next` separated by operators from `op`.
fn binary_chain(
    input: &str,
    next: fn(&str) -> IResult<&str, Ast>,
    op: fn(&str) -> IResult<&str, BinaryOp>,
) -> IResult<&str, Ast> {
    let (mut input, mut lhs) = next(input)?;
    loop {
        match op(input) {
            Ok((rest, o)) => {
                let (rest, rhs) = next(rest)?;
                lhs = Ast::Binary(o, Box::new(lhs), Box::new(rhs));
                input = rest;
            }
            Err(nom::Err::Error(_)) => return Ok((input, lhs)),
            Err(e) => return Err(e),
        }
    }
}

fn or_expr(input: &str) -> IResult<&str, Ast> {
    binary_chain(input, and_expr, |i| {
        value(BinaryOp::Or, ws(tag("||"))).parse(i)
    })
}

fn and_expr(input: &str) -> IResult<&str, Ast> {
    binary_chain(input, eq_expr, |i| {
        value(BinaryOp::And, ws(tag("&&"))).parse(i)
    })
}

fn eq_expr(input: &str) -> IResult<&str, Ast> {
    binary_chain(input, rel_expr, |i| {
        ws(alt((
            value(BinaryOp::Eq, tag("==")),
            value(BinaryOp::Ne, tag("!=")),
        )))
        .parse(i)
    })
}

fn rel_expr(input: &str) -> IResult<&str, Ast> {
    binary_chain(input, add_expr, |i| {
        ws(alt((
            value(BinaryOp::Le, tag("<=")),
            value(BinaryOp::Ge, tag(">=")),
            value(BinaryOp::Lt, tag("<")),
            value(BinaryOp::Gt, tag(">")),
            value(BinaryOp::Match, tag("=~")),
            value(BinaryOp::NotMatch, tag("!~")),
            value(
                BinaryOp::In,
                terminated(tag("in"), not(satisfy(is_ident_char))),
            ),
        )))
        .parse(i)
    })
}

fn add_expr(input: &str) -> IResult<&str, Ast> {
    binary_chain(input, mul_expr, |i| {
        ws(alt((
            value(BinaryOp::Add, char('+')),
            value(BinaryOp::Sub, char('-')),
        )))
        .parse(i)
    })
}

fn mul_expr(input: &str) -> IResult<&str, Ast> {
    binary_chain(input, unary_expr, |i| {
        ws(alt((
            value(BinaryOp::Mul, char('*')),
            value(BinaryOp::Div, char('/')),
            value(BinaryOp::Rem, char('%')),
        )))
        .parse(i)
    })
}

fn unary_expr(input: &str) -> IResult<&str, Ast> {
    let op = opt(ws(alt((
        value(UnaryOp::Not, char('!')),
        value(UnaryOp::Neg, char('-')),
    ))))
    .parse(input)?;

    match op {
        (rest, Some(op)) => {
            let (rest, operand) = unary_expr(rest)?;
            Ok((rest, Ast::Unary(op, Box::new(operand))))
        }
        (rest, None) => postfix_expr(rest),
    }
}

enum Postfix {
    Member(String),
    Index(Ast),
}

fn member_step(input: &str) -> IResult<&str, Postfix> {
    let (input, name) = preceded(ws(char('.')), identifier).parse(input)?;
    // `metric.Name()` and `metric.Name` are the same member.
    let (input, _) = opt(pair(ws(char('(')), char(')'))).parse(input)?;
    Ok((input, Postfix::Member(name.to_string())))
}

fn index_step(input: &str) -> IResult<&str, Postfix> {
    let (input, idx) = delimited(ws(char('[')), expr, ws(char(']'))).parse(input)?;
    Ok((input, Postfix::Index(idx)))
}

fn postfix_expr(input: &str) -> IResult<&str, Ast> {
    let (mut input, mut base) = primary(input)?;
    loop {
        match opt(alt((member_step, index_step))).parse(input)? {
            (rest, Some(Postfix::Member(name))) => {
                base = Ast::Member(Box::new(base), name);
                input = rest;
            }
            (rest, Some(Postfix::Index(idx))) => {
                base = Ast::Index(Box::new(base), Box::new(idx));
                input = rest;
            }
            (rest, None) => return Ok((rest, base)),
        }
    }
}

fn primary(input: &str) -> IResult<&str, Ast> {
    ws(alt((
        number,
        string_ast,
        list,
        ident_or_call,
        delimited(char('('), expr, char(')')),
    )))
    .parse(input)
}

fn string_ast(input: &str) -> IResult<&str, Ast> {
    let (input, s) = string_lit(input)?;
    Ok((input, Ast::Str(s)))
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(take_while1(is_ident_start), take_while(is_ident_char))).parse(input)
}

fn ident_or_call(input: &str) -> IResult<&str, Ast> {
    let (input, name) = identifier(input)?;
    match name {
        "true" => return Ok((input, Ast::Bool(true))),
        "false" => return Ok((input, Ast::Bool(false))),
        _ => {}
    }

    let (input, args) = opt(delimited(
        ws(char('(')),
        separated_list0(ws(char(',')), expr),
        ws(char(')')),
    ))
    .parse(input)?;

    match args {
        Some(args) => Ok((input, Ast::Call(name.to_string(), args))),
        None => Ok((input, Ast::Ident(name.to_string()))),
    }
}

fn list(input: &str) -> IResult<&str, Ast> {
    let (input, items) = delimited(
        ws(char('[')),
        separated_list0(ws(char(',')), expr),
        ws(char(']')),
    )
    .parse(input)?;
    Ok((input, Ast::List(items)))
}

fn number(input: &str) -> IResult<&str, Ast> {
    let (rest, text) = recognize((
        digit1,
        opt(pair(char('.'), digit0)),
        opt((one_of("eE"), opt(one_of("+-")), digit1)),
    ))
    .parse(input)?;

    let is_float = text.contains(['.', 'e', 'E']);
    if !is_float {
        if let Ok(v) = text.parse::<i64>() {
            return Ok((rest, Ast::Int(v)));
        }
    }
    match text.parse::<f64>() {
        Ok(v) => Ok((rest, Ast::Float(v))),
        Err(_) => Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Float,
        ))),
    }
}

/// Double-quoted string. `\"`, `\\`, `\n` and `\t` are unescaped; any other
/// backslash sequence is kept verbatim so regex classes like `\d` survive.
fn string_lit(input: &str) -> IResult<&str, String> {
    let (body, _) = char('"').parse(input)?;
    let mut out = String::new();
    let mut chars = body.char_indices();

    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Ok((&body[i + 1..], out)),
            '\\' => match chars.next() {
                Some((_, '"')) => out.push('"'),
                Some((_, '\\')) => out.push('\\'),
                Some((_, 'n')) => out.push('\n'),
                Some((_, 't')) => out.push('\t'),
                Some((_, other)) => {
                    out.push('\\');
                    out.push(other);
                }
                None => break,
            },
            c => out.push(c),
        }
    }

    Err(nom::Err::Error(nom::error::Error::new(
        input,
        nom::error::ErrorKind::Char,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bin(op: BinaryOp, l: Ast, r: Ast) -> Ast {
        Ast::Binary(op, Box::new(l), Box::new(r))
    }

    fn ident(s: &str) -> Ast {
        Ast::Ident(s.to_string())
    }

    #[test]
    fn test_precedence() {
        let ast = parse("a + b * c == d || !e").expect("parses");
        let expected = bin(
            BinaryOp::Or,
            bin(
                BinaryOp::Eq,
                bin(
                    BinaryOp::Add,
                    ident("a"),
                    bin(BinaryOp::Mul, ident("b"), ident("c")),
                ),
                ident("d"),
            ),
            Ast::Unary(UnaryOp::Not, Box::new(ident("e"))),
        );
        assert_eq!(ast, expected);
    }

    #[test]
    fn test_left_associative() {
        let ast = parse("10 - 4 - 3").expect("parses");
        assert_eq!(
            ast,
            bin(
                BinaryOp::Sub,
                bin(BinaryOp::Sub, Ast::Int(10), Ast::Int(4)),
                Ast::Int(3)
            )
        );
    }

    #[test]
    fn test_member_and_index() {
        let ast = parse(r#"metric.Tags["type"]"#).expect("parses");
        assert_eq!(
            ast,
            Ast::Index(
                Box::new(Ast::Member(Box::new(ident("metric")), "Tags".to_string())),
                Box::new(Ast::Str("type".to_string()))
            )
        );

        let ast = parse("metric.Name()").expect("parses");
        assert_eq!(
            ast,
            Ast::Member(Box::new(ident("metric")), "Name".to_string())
        );
    }

    #[test]
    fn test_call_and_list() {
        let ast = parse(r#"match("cpu_\d+", name) && 3 in [1, 2, 3]"#).expect("parses");
        assert_eq!(
            ast,
            bin(
                BinaryOp::And,
                Ast::Call(
                    "match".to_string(),
                    vec![Ast::Str(r"cpu_\d+".to_string()), ident("name")]
                ),
                bin(
                    BinaryOp::In,
                    Ast::Int(3),
                    Ast::List(vec![Ast::Int(1), Ast::Int(2), Ast::Int(3)])
                )
            )
        );
    }

    #[test]
    fn test_in_requires_word_boundary() {
        // `index` is an identifier, not `in` followed by `dex`.
        assert!(parse("a index").is_err());
        assert_eq!(
            parse("a in b").expect("parses"),
            bin(BinaryOp::In, ident("a"), ident("b"))
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(parse("42").expect("int"), Ast::Int(42));
        assert_eq!(parse("2.5").expect("float"), Ast::Float(2.5));
        assert_eq!(parse("1e3").expect("exp"), Ast::Float(1000.0));
    }

    #[test]
    fn test_ternary() {
        let ast = parse("x > 1 ? \"big\" : \"small\"").expect("parses");
        assert_eq!(
            ast,
            Ast::Ternary(
                Box::new(bin(BinaryOp::Gt, ident("x"), Ast::Int(1))),
                Box::new(Ast::Str("big".to_string())),
                Box::new(Ast::Str("small".to_string()))
            )
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            parse(r#""a\"b\\c\td""#).expect("parses"),
            Ast::Str("a\"b\\c\td".to_string())
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("a +").is_err());
        assert!(parse("(a").is_err());
        assert!(parse("\"unterminated").is_err());
        assert!(parse("a b").is_err());
        assert!(parse("").is_err());
    }
}
