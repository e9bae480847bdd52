//! The parser.
//!
//! Unlambda's grammar is prefix application over atomic combinators, so the
//! parser is LL(0): every token lands in the next free operand slot of the
//! innermost open application. The output is the preorder traversal of the
//! tree in a flat array. A node's left child is the node right after it;
//! the index of the right child is stored on the left child as `sibling`.
//!
//! Two synthesized nodes wrap the program as `` `e <program> ``, so a
//! finished run always terminates by applying `e`.

use thiserror::Error;
use tracing::debug;

use crate::lexer::{Token, TokenKind};

/// All parse failures look the same from outside.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("bad syntax")]
pub struct ParseError;

/// One AST node in preorder position.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AstNode {
    pub token: Token,
    /// Index of the right sibling when this node is a left child, else 0.
    pub sibling: u32,
}

/// The preorder AST array. Node 0 is the guard application, node 1 the
/// guard `e`, node 2 the root of the parsed program.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Ast {
    pub nodes: Vec<AstNode>,
}

impl Ast {
    /// Left child of the application at `idx`.
    #[inline]
    pub fn left(&self, idx: usize) -> &AstNode {
        &self.nodes[idx + 1]
    }

    /// Right child of the application at `idx`.
    #[inline]
    pub fn right(&self, idx: usize) -> &AstNode {
        &self.nodes[self.left(idx).sibling as usize]
    }
}

pub fn parse(tokens: &[Token]) -> Result<Ast, ParseError> {
    let mut nodes = Vec::with_capacity(tokens.len() + 2);
    nodes.push(AstNode {
        token: Token::new(TokenKind::Apply),
        sibling: 0,
    });
    nodes.push(AstNode {
        token: Token::new(TokenKind::E),
        sibling: 2,
    });

    // Open applications; the flag records whether the left operand slot is
    // already taken. The guard `e` occupies the outermost left slot.
    let mut open: Vec<(u32, bool)> = vec![(0, true)];
    for token in tokens {
        let idx = nodes.len() as u32;
        match open.last_mut() {
            None => return Err(ParseError),
            Some(top) => {
                if !top.1 {
                    top.1 = true;
                } else {
                    let app = top.0 as usize;
                    nodes[app + 1].sibling = idx;
                    open.pop();
                }
            }
        }
        nodes.push(AstNode {
            token: *token,
            sibling: 0,
        });
        if token.kind == TokenKind::Apply {
            open.push((idx, false));
        }
    }
    if !open.is_empty() {
        return Err(ParseError);
    }
    debug!("parse completed, {} nodes", nodes.len());
    Ok(Ast { nodes })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::lexer::lex;

    fn parse_source(source: &str) -> Result<Ast, ParseError> {
        parse(&lex(source.as_bytes()).unwrap())
    }

    fn node(kind: TokenKind, sibling: u32) -> AstNode {
        AstNode {
            token: Token::new(kind),
            sibling,
        }
    }

    #[test]
    fn single_combinator_sits_under_the_guard() {
        let ast = parse_source("i").unwrap();
        assert_eq!(
            ast.nodes,
            vec![
                node(TokenKind::Apply, 0),
                node(TokenKind::E, 2),
                node(TokenKind::I, 0),
            ]
        );
    }

    #[test]
    fn application_links_left_and_right() {
        let ast = parse_source("`.*i").unwrap();
        assert_eq!(
            ast.nodes,
            vec![
                node(TokenKind::Apply, 0),
                node(TokenKind::E, 2),
                node(TokenKind::Apply, 0),
                AstNode {
                    token: Token::with_char(TokenKind::Out, b'*'),
                    sibling: 4,
                },
                node(TokenKind::I, 0),
            ]
        );
        assert_eq!(ast.left(2).token.kind, TokenKind::Out);
        assert_eq!(ast.right(2).token.kind, TokenKind::I);
    }

    #[test]
    fn nested_applications() {
        let ast = parse_source("``ski").unwrap();
        // Preorder: guard-app, e, app, app, s, k, i.
        assert_eq!(ast.nodes.len(), 7);
        assert_eq!(ast.left(2).token.kind, TokenKind::Apply);
        assert_eq!(ast.right(2).token.kind, TokenKind::I);
        assert_eq!(ast.left(3).token.kind, TokenKind::S);
        assert_eq!(ast.right(3).token.kind, TokenKind::K);
    }

    #[test]
    fn empty_program_is_bad_syntax() {
        assert_eq!(parse_source(""), Err(ParseError));
        assert_eq!(parse_source("# only a comment\n"), Err(ParseError));
    }

    #[test]
    fn dangling_applicator_is_bad_syntax() {
        assert_eq!(parse_source("`"), Err(ParseError));
        assert_eq!(parse_source("`i"), Err(ParseError));
        assert_eq!(parse_source("``ss"), Err(ParseError));
    }

    #[test]
    fn surplus_operand_is_bad_syntax() {
        assert_eq!(parse_source("ii"), Err(ParseError));
        assert_eq!(parse_source("`ski"), Err(ParseError));
    }
}
