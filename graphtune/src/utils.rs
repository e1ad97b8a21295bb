const INDENT_SIZE: usize = 2;

pub fn indent(depth: usize) -> String {
    " ".repeat(depth * INDENT_SIZE)
}
