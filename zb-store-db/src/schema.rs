// SPDX-License-Identifier: MIT

//! Schema definitions.
//!
//! The exact schema is internal and may change between releases; only
//! the [crate::StoreDb] API is stable.

pub const SCHEMA_SQL: &str = r#"
create table if not exists Objects (
    id               integer primary key autoincrement not null,
    path             text unique not null,
    narHash          text not null,
    narSize          integer not null,
    ca               text,
    deriver          text,
    registrationTime integer not null
);

create table if not exists Refs (
    referrer  integer not null,
    reference integer not null,
    primary key (referrer, reference),
    foreign key (referrer) references Objects(id) on delete cascade,
    foreign key (reference) references Objects(id) on delete restrict
);

create index if not exists IndexReferrer on Refs(referrer);
create index if not exists IndexReference on Refs(reference);

create trigger if not exists DeleteSelfRefs before delete on Objects
  begin
    delete from Refs where referrer = old.id and reference = old.id;
  end;

create table if not exists Builds (
    id           integer primary key autoincrement not null,
    status       text not null,
    startedAt    integer not null,
    endedAt      integer,
    drvPaths     text not null,
    expandResult text
);

create table if not exists BuildResults (
    buildId    integer not null,
    drvPath    text not null,
    outputName text not null,
    outputPath text,
    status     text not null,
    primary key (buildId, drvPath, outputName),
    foreign key (buildId) references Builds(id) on delete cascade
);

create table if not exists LogChunks (
    buildId integer not null,
    seq     integer not null,
    bytes   blob not null,
    ts      integer not null,
    primary key (buildId, seq),
    foreign key (buildId) references Builds(id) on delete cascade
);

create index if not exists IndexLogChunksTs on LogChunks(ts);

create table if not exists Realisations (
    fingerprint text not null,
    outputName  text not null,
    outputPath  text not null,
    ca          text not null,
    primary key (fingerprint, outputName)
);
"#;
