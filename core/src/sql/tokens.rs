/// SQL keywords and punctuation used by the statement renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Token {
    // Clauses
    SELECT,
    FROM,
    WHERE,
    ORDER_BY,
    LIMIT,
    OFFSET,
    LEFT_JOIN,
    ON,
    AS,
    WITH,
    INSERT_INTO,
    VALUES,
    UPDATE,
    SET,
    DELETE_FROM,
    RETURNING,
    ON_CONFLICT,
    DO_NOTHING,
    DO_UPDATE_SET,

    // Logic and predicates
    AND,
    OR,
    IN,
    IS_NULL,
    IS_NOT_NULL,
    LIKE,
    ILIKE,
    TRUE,

    // Ordering
    ASC,
    DESC,

    // Punctuation and operators
    LPAREN,
    RPAREN,
    COMMA,
    STAR,
    EQ,
    NE,
    LT,
    GT,
    LE,
    GE,
    PLUS,
    MINUS,
    MUL,
    DIV,
}

impl Token {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Token::SELECT => "SELECT",
            Token::FROM => "FROM",
            Token::WHERE => "WHERE",
            Token::ORDER_BY => "ORDER BY",
            Token::LIMIT => "LIMIT",
            Token::OFFSET => "OFFSET",
            Token::LEFT_JOIN => "LEFT JOIN",
            Token::ON => "ON",
            Token::AS => "AS",
            Token::WITH => "WITH",
            Token::INSERT_INTO => "INSERT INTO",
            Token::VALUES => "VALUES",
            Token::UPDATE => "UPDATE",
            Token::SET => "SET",
            Token::DELETE_FROM => "DELETE FROM",
            Token::RETURNING => "RETURNING",
            Token::ON_CONFLICT => "ON CONFLICT",
            Token::DO_NOTHING => "DO NOTHING",
            Token::DO_UPDATE_SET => "DO UPDATE SET",
            Token::AND => "AND",
            Token::OR => "OR",
            Token::IN => "IN",
            Token::IS_NULL => "IS NULL",
            Token::IS_NOT_NULL => "IS NOT NULL",
            Token::LIKE => "LIKE",
            Token::ILIKE => "ILIKE",
            Token::TRUE => "TRUE",
            Token::ASC => "ASC",
            Token::DESC => "DESC",
            Token::LPAREN => "(",
            Token::RPAREN => ")",
            Token::COMMA => ",",
            Token::STAR => "*",
            Token::EQ => "=",
            Token::NE => "!=",
            Token::LT => "<",
            Token::GT => ">",
            Token::LE => "<=",
            Token::GE => ">=",
            Token::PLUS => "+",
            Token::MINUS => "-",
            Token::MUL => "*",
            Token::DIV => "/",
        }
    }
}
