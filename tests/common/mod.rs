//! Hand-assembled class files for the integration tests.
//!
//! The bytes are written directly, not through `debug_agent::classfile`, so
//! that parser and writer are checked against an independent encoder.

#![allow(dead_code)]

use debug_agent::classfile::{ClassFile, CpInfo, MemberInfo};

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_PRIVATE: u16 = 0x0002;
pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_SYNCHRONIZED: u16 = 0x0020;
pub const ACC_NATIVE: u16 = 0x0100;
pub const ACC_INTERFACE: u16 = 0x0200;
pub const ACC_ABSTRACT: u16 = 0x0400;

pub struct CpBuilder {
    entries: Vec<Vec<u8>>,
}

impl CpBuilder {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    fn push(&mut self, entry: Vec<u8>) -> u16 {
        self.entries.push(entry);
        self.entries.len() as u16
    }

    pub fn utf8(&mut self, s: &str) -> u16 {
        let mut entry = vec![1];
        entry.extend_from_slice(&(s.len() as u16).to_be_bytes());
        entry.extend_from_slice(s.as_bytes());
        self.push(entry)
    }

    pub fn class(&mut self, name: &str) -> u16 {
        let name_index = self.utf8(name);
        let mut entry = vec![7];
        entry.extend_from_slice(&name_index.to_be_bytes());
        self.push(entry)
    }

    pub fn string(&mut self, value: &str) -> u16 {
        let string_index = self.utf8(value);
        let mut entry = vec![8];
        entry.extend_from_slice(&string_index.to_be_bytes());
        self.push(entry)
    }

    pub fn integer(&mut self, value: i32) -> u16 {
        let mut entry = vec![3];
        entry.extend_from_slice(&value.to_be_bytes());
        self.push(entry)
    }

    /// Takes two slots; the second one is left empty.
    pub fn long(&mut self, value: i64) -> u16 {
        let mut entry = vec![5];
        entry.extend_from_slice(&value.to_be_bytes());
        let index = self.push(entry);
        self.push(Vec::new());
        index
    }

    pub fn double(&mut self, value: f64) -> u16 {
        let mut entry = vec![6];
        entry.extend_from_slice(&value.to_bits().to_be_bytes());
        let index = self.push(entry);
        self.push(Vec::new());
        index
    }

    pub fn methodref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        let class_index = self.class(class);
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        let mut nat = vec![12];
        nat.extend_from_slice(&name_index.to_be_bytes());
        nat.extend_from_slice(&descriptor_index.to_be_bytes());
        let nat_index = self.push(nat);
        let mut entry = vec![10];
        entry.extend_from_slice(&class_index.to_be_bytes());
        entry.extend_from_slice(&nat_index.to_be_bytes());
        self.push(entry)
    }

    /// `constant_pool_count` followed by the entries.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        u2(out, (self.entries.len() + 1) as u16);
        for entry in &self.entries {
            out.extend_from_slice(entry);
        }
    }
}

pub fn u1(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

pub fn u2(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn u4(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn push_attr(out: &mut Vec<u8>, name_index: u16, info: &[u8]) {
    u2(out, name_index);
    u4(out, info.len() as u32);
    out.extend_from_slice(info);
}

/// One method of a [`TestClass`].
pub struct TestMethod {
    pub flags: u16,
    pub name: &'static str,
    pub descriptor: &'static str,
    /// `None` for native and abstract methods.
    pub code: Option<Vec<u8>>,
    pub throws: Vec<&'static str>,
    /// Descriptors of marker annotations, written as `RuntimeVisibleAnnotations`.
    pub annotations: Vec<&'static str>,
}

impl TestMethod {
    pub fn new(flags: u16, name: &'static str, descriptor: &'static str, code: &[u8]) -> Self {
        Self { flags, name, descriptor, code: Some(code.to_vec()), throws: Vec::new(), annotations: Vec::new() }
    }

    pub fn bodiless(flags: u16, name: &'static str, descriptor: &'static str) -> Self {
        Self { flags, name, descriptor, code: None, throws: Vec::new(), annotations: Vec::new() }
    }

    pub fn throws(mut self, class: &'static str) -> Self {
        self.throws.push(class);
        self
    }

    pub fn annotated(mut self, descriptor: &'static str) -> Self {
        self.annotations.push(descriptor);
        self
    }
}

pub struct TestClass {
    pub major: u16,
    pub flags: u16,
    pub name: &'static str,
    pub methods: Vec<TestMethod>,
}

impl TestClass {
    pub fn new(name: &'static str) -> Self {
        Self { major: 52, flags: ACC_PUBLIC | 0x0020, name, methods: Vec::new() }
    }

    pub fn major(mut self, major: u16) -> Self {
        self.major = major;
        self
    }

    pub fn interface(mut self) -> Self {
        self.flags = ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT;
        self
    }

    pub fn method(mut self, method: TestMethod) -> Self {
        self.methods.push(method);
        self
    }

    /// Assembles the class. Every method body gets a `LineNumberTable` so
    /// that nested Code attributes are exercised too.
    pub fn build(&self) -> Vec<u8> {
        let mut cp = CpBuilder::new();
        let this_class = cp.class(self.name);
        let super_class = cp.class("java/lang/Object");
        let code_name = cp.utf8("Code");
        let lnt_name = cp.utf8("LineNumberTable");
        let exceptions_name = cp.utf8("Exceptions");
        let annotations_name = cp.utf8("RuntimeVisibleAnnotations");
        let source_file_name = cp.utf8("SourceFile");
        let source_file = cp.utf8("Synthetic.java");

        let mut methods = Vec::new();
        u2(&mut methods, self.methods.len() as u16);
        for (line, method) in self.methods.iter().enumerate() {
            let name_index = cp.utf8(method.name);
            let descriptor_index = cp.utf8(method.descriptor);
            u2(&mut methods, method.flags);
            u2(&mut methods, name_index);
            u2(&mut methods, descriptor_index);

            let mut attrs = Vec::new();
            let mut count = 0;
            if let Some(code) = &method.code {
                let mut info = Vec::new();
                u2(&mut info, 8);
                u2(&mut info, 8);
                u4(&mut info, code.len() as u32);
                info.extend_from_slice(code);
                u2(&mut info, 0);
                u2(&mut info, 1);
                let mut lnt = Vec::new();
                u2(&mut lnt, 1);
                u2(&mut lnt, 0);
                u2(&mut lnt, 10 + line as u16);
                push_attr(&mut info, lnt_name, &lnt);
                push_attr(&mut attrs, code_name, &info);
                count += 1;
            }
            if !method.throws.is_empty() {
                let mut info = Vec::new();
                u2(&mut info, method.throws.len() as u16);
                for class in &method.throws {
                    let index = cp.class(class);
                    u2(&mut info, index);
                }
                push_attr(&mut attrs, exceptions_name, &info);
                count += 1;
            }
            if !method.annotations.is_empty() {
                let mut info = Vec::new();
                u2(&mut info, method.annotations.len() as u16);
                for descriptor in &method.annotations {
                    let index = cp.utf8(descriptor);
                    u2(&mut info, index);
                    u2(&mut info, 0);
                }
                push_attr(&mut attrs, annotations_name, &info);
                count += 1;
            }
            u2(&mut methods, count);
            methods.extend_from_slice(&attrs);
        }

        let mut bytes = Vec::new();
        u4(&mut bytes, 0xCAFEBABE);
        u2(&mut bytes, 0);
        u2(&mut bytes, self.major);
        cp.write_to(&mut bytes);
        u2(&mut bytes, self.flags);
        u2(&mut bytes, this_class);
        u2(&mut bytes, super_class);
        u2(&mut bytes, 0);
        u2(&mut bytes, 0);
        bytes.extend_from_slice(&methods);
        u2(&mut bytes, 1);
        let mut sf = Vec::new();
        u2(&mut sf, source_file);
        push_attr(&mut bytes, source_file_name, &sf);
        bytes
    }
}

/// `aconst_null; areturn`
pub const RETURN_NULL: &[u8] = &[0x01, 0xb0];
/// `return`
pub const RETURN_VOID: &[u8] = &[0xb1];

/// A stand-in for `java.net.InetAddress` with both `getByName` overloads.
pub fn inet_address() -> TestClass {
    TestClass::new("java/net/InetAddress")
        .method(TestMethod::new(ACC_PUBLIC, "<init>", "()V", RETURN_VOID))
        .method(
            TestMethod::new(ACC_PUBLIC | ACC_STATIC, "getByName", "(Ljava/lang/String;)Ljava/net/InetAddress;", RETURN_NULL)
                .throws("java/net/UnknownHostException"),
        )
        .method(TestMethod::new(
            ACC_PUBLIC | ACC_STATIC,
            "getByName",
            "(Ljava/lang/String;Ljava/net/InetAddress;)Ljava/net/InetAddress;",
            RETURN_NULL,
        ))
        .method(TestMethod::new(ACC_PUBLIC, "getHostName", "()Ljava/lang/String;", RETURN_NULL))
        .method(TestMethod::bodiless(ACC_PRIVATE | ACC_STATIC | ACC_NATIVE, "init", "()V"))
}

pub fn method_named<'a>(class: &'a ClassFile, name: &str, descriptor: &str) -> Option<&'a MemberInfo> {
    class
        .methods
        .iter()
        .find(|m| class.member_name(m).unwrap() == name && class.member_descriptor(m).unwrap() == descriptor)
}

/// `(owner, name, descriptor)` of a Methodref or InterfaceMethodref.
pub fn method_ref(class: &ClassFile, index: u16) -> (String, String, String) {
    let (class_index, nat_index) = match class.constant_pool.get(index).unwrap() {
        CpInfo::Methodref { class_index, name_and_type_index }
        | CpInfo::InterfaceMethodref { class_index, name_and_type_index } => (*class_index, *name_and_type_index),
        other => panic!("not a method reference: {other:?}"),
    };
    let CpInfo::NameAndType { name_index, descriptor_index } = class.constant_pool.get(nat_index).unwrap() else {
        panic!("not a NameAndType");
    };
    (
        class.constant_pool.get_class_name(class_index).unwrap(),
        class.constant_pool.get_utf8(*name_index).unwrap(),
        class.constant_pool.get_utf8(*descriptor_index).unwrap(),
    )
}

/// Every `CONSTANT_String` value in the pool.
pub fn string_constants(class: &ClassFile) -> Vec<String> {
    class
        .constant_pool
        .iter()
        .filter_map(|(_, e)| match e {
            CpInfo::String { string_index } => Some(class.constant_pool.get_utf8(*string_index).unwrap()),
            _ => None,
        })
        .collect()
}
