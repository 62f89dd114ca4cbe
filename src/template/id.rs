/// Generates node ids unique within one template.
///
/// Template node ids never leave the Request Manager, so they only need to
/// be unique per template; the resolver assigns globally fresh job ids
/// when a chain is created.
#[derive(Debug, Default)]
pub struct IdGen {
    next: u32,
}

impl IdGen {
    /// Returns a new id derived from `name`.
    pub fn id(&mut self, name: &str) -> String {
        let n = self.next;
        self.next += 1;
        format!("{name}@{n}")
    }
}

/// Makes one [`IdGen`] per template.
#[derive(Debug, Default, Clone)]
pub struct IdGenFactory;

impl IdGenFactory {
    pub fn make(&self) -> IdGen {
        IdGen::default()
    }
}
